use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cloudfn")]
#[command(about = "Build, deploy and serve user functions on a container substrate")]
#[command(version)]
pub struct Args {
    /// Path to a YAML settings file (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Override the bind address from the settings file
    #[arg(long, value_name = "ADDR")]
    pub bind_addr: Option<String>,

    /// Override the listen port from the settings file
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Path to a .env file for registry credentials
    #[arg(long, value_name = "FILE")]
    pub env_file: Option<PathBuf>,
}
