//! Build-context rendering for function image builds.
//!
//! A build job gets four files: the submitted source, a language-specific
//! Dockerfile, a language-specific dependency manifest, and the registry
//! credential document the executor pushes with. All of it is rendered here,
//! as pure functions over [`Settings`] values; nothing in this module reads
//! the process environment.

use std::collections::HashMap;

use crate::model::{Function, Language};
use crate::settings::Settings;

use super::{build_job_name, BuildJobSpec};

const NODEJS_DOCKERFILE: &str = r#"FROM node:alpine
WORKDIR /app
COPY package.json .
RUN npm install
COPY . .
CMD ["npm", "start"]
"#;

const NODEJS_PACKAGE_JSON: &str = r#"{
  "name": "user-code-worker",
  "version": "1.0.0",
  "main": "index.js",
  "license": "MIT",
  "dependencies": {
    "express": "^4.17.1"
  }
}
"#;

/// Files rendered into the build job's workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    /// Submitted source, written as the language's entrypoint file.
    pub source: String,
    pub source_filename: &'static str,
    pub dockerfile: String,
    pub manifest: String,
    pub manifest_filename: &'static str,
    /// Docker auth config granting push access to the registry.
    pub docker_auth: String,
}

/// Fully qualified image tag for a function:
/// `<registry>[/<project>]/<functionId>:latest`.
pub fn image_name(registry: &str, project: &str, function_id: &str) -> String {
    if project.is_empty() {
        format!("{}/{}:latest", registry, function_id)
    } else {
        format!("{}/{}/{}:latest", registry, project, function_id)
    }
}

fn dockerfile_for(language: Language) -> &'static str {
    match language {
        Language::Nodejs => NODEJS_DOCKERFILE,
    }
}

fn manifest_for(language: Language) -> (&'static str, &'static str) {
    match language {
        Language::Nodejs => (NODEJS_PACKAGE_JSON, "package.json"),
    }
}

fn entrypoint_for(language: Language) -> &'static str {
    match language {
        Language::Nodejs => "index.js",
    }
}

/// Docker `config.json` content with the registry's base64 credentials.
pub fn docker_auth_json(registry: &str, base64_credentials: &str) -> String {
    serde_json::json!({
        "auths": { registry: { "auth": base64_credentials } }
    })
    .to_string()
}

/// Render the build context for a function's source.
pub fn build_context(settings: &Settings, code: &str, language: Language) -> BuildContext {
    let (manifest, manifest_filename) = manifest_for(language);
    BuildContext {
        source: code.to_string(),
        source_filename: entrypoint_for(language),
        dockerfile: dockerfile_for(language).to_string(),
        manifest: manifest.to_string(),
        manifest_filename,
        docker_auth: docker_auth_json(&settings.registry, &settings.registry_credentials),
    }
}

/// Full build-job spec for a function, labeled `builder=<id>` so the build
/// reconciler can watch it.
pub fn build_job_spec(settings: &Settings, function: &Function) -> BuildJobSpec {
    let id = function.id.to_string();
    let mut labels = HashMap::new();
    labels.insert("builder".to_string(), id.clone());

    BuildJobSpec {
        name: build_job_name(&id),
        labels,
        language: function.language,
        image: image_name(&settings.registry, &settings.registry_project, &id),
        context: build_context(settings, &function.code, function.language),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_name() {
        assert_eq!(
            image_name("ghcr.io", "acme", "fn-1"),
            "ghcr.io/acme/fn-1:latest"
        );
        assert_eq!(image_name("ghcr.io", "", "fn-1"), "ghcr.io/fn-1:latest");
    }

    #[test]
    fn test_docker_auth_json() {
        let auth = docker_auth_json("ghcr.io", "dXNlcjp0b2tlbg==");
        let parsed: serde_json::Value = serde_json::from_str(&auth).unwrap();
        assert_eq!(parsed["auths"]["ghcr.io"]["auth"], "dXNlcjp0b2tlbg==");
    }

    #[test]
    fn test_build_context_nodejs() {
        let settings = Settings::default();
        let ctx = build_context(&settings, "console.log('hi')", Language::Nodejs);

        assert_eq!(ctx.source_filename, "index.js");
        assert_eq!(ctx.manifest_filename, "package.json");
        assert!(ctx.dockerfile.contains("FROM node:alpine"));
        assert!(ctx.manifest.contains("express"));
        assert_eq!(ctx.source, "console.log('hi')");
    }

    #[test]
    fn test_build_job_spec_labels_and_name() {
        let settings = Settings::default();
        let function =
            Function::new("o", "p", "console.log(1)", Language::Nodejs);
        let spec = build_job_spec(&settings, &function);

        let id = function.id.to_string();
        assert_eq!(spec.name, format!("build-{}", id));
        assert_eq!(spec.labels.get("builder"), Some(&id));
        assert!(spec.image.starts_with("ghcr.io/"));
        assert!(spec.image.ends_with(":latest"));
    }

    #[test]
    fn test_build_job_names_distinct_per_function() {
        let settings = Settings::default();
        let a = build_job_spec(&settings, &Function::new("o", "p", "a", Language::Nodejs));
        let b = build_job_spec(&settings, &Function::new("o", "p", "b", Language::Nodejs));
        assert_ne!(a.name, b.name);
    }
}
