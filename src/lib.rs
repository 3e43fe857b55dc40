//! cloudfn: build, deploy and serve user functions on a container substrate.
//!
//! The control plane turns submitted source code into a running service in
//! three steps: an image build (one-shot job watched to completion), a
//! deployment rollout (watched the same way), and a reverse proxy that
//! routes `/serve/<id>` traffic to the function's service. All state lives
//! in a `Function` record whose status triple is owned by the
//! [`lifecycle::Lifecycle`] service.

pub mod cli;
pub mod lifecycle;
pub mod logs;
pub mod model;
pub mod proxy;
pub mod reconcile;
pub mod server;
pub mod settings;
pub mod store;
pub mod substrate;
