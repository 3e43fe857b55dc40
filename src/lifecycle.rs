//! Function lifecycle service: the only writer of lifecycle state.
//!
//! Every operation resolves the (owner, project) pair to its
//! [`ProjectConfig`] gate first, then validates the function's status triple
//! before touching the substrate. Precondition failures are uniform and
//! never mutate the record.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::model::{Action, BuildStatus, DeployStatus, Function, Language, ProjectConfig};
use crate::reconcile::{watch_build, watch_rollout};
use crate::settings::Settings;
use crate::store::{ConfigStore, FunctionStore, StoreError};
use crate::substrate::image::build_job_spec;
use crate::substrate::{
    build_job_name, service_name, DeploymentSpec, ServiceSpec, Substrate, SubstrateError,
};

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Uniform rejection for any action invalid against the current status
    /// triple. Deliberately does not say which check failed.
    #[error("Invalid action for the function's current status")]
    PreconditionFailed,

    #[error("No service config found for project '{0}'")]
    ConfigMissing(String),

    #[error("Function service is disabled for project '{0}'")]
    ConfigDisabled(String),

    #[error("Function '{0}' not found")]
    NotFound(Uuid),

    #[error(transparent)]
    Substrate(#[from] SubstrateError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Deploy is valid only from a fresh successful build.
pub fn can_deploy(function: &Function) -> bool {
    function.build_status == BuildStatus::Success
        && function.deploy_status == DeployStatus::NotDeployed
        && function.last_action == Action::Build
}

/// Redeploy is valid only for an updated, previously deployed function
/// whose image is still good.
pub fn can_redeploy(function: &Function) -> bool {
    function.last_action == Action::Update
        && function.deploy_status == DeployStatus::RedeployRequired
        && function.build_status == BuildStatus::Success
}

/// Orchestrates builds, rollouts and teardown for user functions.
pub struct Lifecycle {
    functions: Arc<dyn FunctionStore>,
    configs: Arc<dyn ConfigStore>,
    substrate: Arc<dyn Substrate>,
    settings: Settings,
}

impl Lifecycle {
    pub fn new(
        functions: Arc<dyn FunctionStore>,
        configs: Arc<dyn ConfigStore>,
        substrate: Arc<dyn Substrate>,
        settings: Settings,
    ) -> Self {
        Self {
            functions,
            configs,
            substrate,
            settings,
        }
    }

    /// Resolve the project's capability gate; missing and disabled configs
    /// reject the operation before anything else runs.
    async fn gate(&self, owner: &str, project_id: &str) -> Result<ProjectConfig, LifecycleError> {
        match self.configs.get(owner, project_id).await? {
            None => Err(LifecycleError::ConfigMissing(project_id.to_string())),
            Some(config) if !config.enabled => {
                Err(LifecycleError::ConfigDisabled(project_id.to_string()))
            }
            Some(config) => Ok(config),
        }
    }

    /// Load a function and verify it belongs to the (owner, project) pair.
    /// A mismatch reads the same as a missing record.
    async fn load(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<Function, LifecycleError> {
        match self.functions.get(id).await? {
            Some(function) if function.owner == owner && function.project_id == project_id => {
                Ok(function)
            }
            _ => Err(LifecycleError::NotFound(id)),
        }
    }

    /// Make sure the substrate namespace exists. Run at startup; safe to
    /// repeat.
    pub async fn ensure_namespace(&self) -> Result<(), LifecycleError> {
        match self.substrate.create_namespace(&self.settings.namespace).await {
            Ok(()) => {
                info!(namespace = %self.settings.namespace, "namespace created");
                Ok(())
            }
            Err(SubstrateError::AlreadyExists(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn create(
        &self,
        owner: &str,
        project_id: &str,
        code: &str,
        language: Language,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;

        let function = Function::new(owner, project_id, code, language);
        self.functions.save(&function).await?;
        info!(function_id = %function.id, owner, project_id, "function created");
        Ok(function)
    }

    pub async fn get(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;
        self.load(owner, project_id, id).await
    }

    pub async fn list(
        &self,
        owner: &str,
        project_id: &str,
    ) -> Result<Vec<Function>, LifecycleError> {
        self.gate(owner, project_id).await?;
        Ok(self.functions.list_by_project(owner, project_id).await?)
    }

    /// Run the function's image build to a terminal status.
    ///
    /// Creates the per-function build job, marks the record `Building`, then
    /// reconciles the job's pods against the build deadline. The job is
    /// removed afterwards whatever the outcome; a failed removal is logged
    /// and does not mask the build result.
    pub async fn build(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;
        let mut function = self.load(owner, project_id, id).await?;

        function.last_action = Action::Build;
        self.run_build(&mut function).await?;
        Ok(function)
    }

    /// Build choreography shared by `build` and `update`: create the job,
    /// persist `Building`, reconcile to a terminal status, remove the job,
    /// write the outcome back. The caller sets `last_action` beforehand.
    async fn run_build(&self, function: &mut Function) -> Result<(), LifecycleError> {
        self.ensure_namespace().await?;

        let spec = build_job_spec(&self.settings, function);
        self.substrate.create_build_job(&spec).await?;
        info!(function_id = %function.id, job = %spec.name, image = %spec.image, "build job created");

        function.build_status = BuildStatus::Building;
        function.build_fail_reason.clear();
        function.touch();
        self.functions.save(function).await?;

        let result = watch_build(
            self.substrate.as_ref(),
            &function.id.to_string(),
            self.settings.build_deadline(),
        )
        .await?;

        if let Err(err) = self.substrate.delete_build_job(&spec.name).await {
            warn!(function_id = %function.id, job = %spec.name, error = %err, "failed to remove build job");
        }

        function.build_status = result.status;
        function.build_fail_reason = match result.status {
            BuildStatus::Failed => result.reason,
            _ => String::new(),
        };
        function.touch();
        self.functions.save(function).await?;
        info!(function_id = %function.id, status = ?function.build_status, "build finished");
        Ok(())
    }

    /// Roll the function's image out as a deployment and service, then
    /// reconcile the rollout to a terminal status.
    pub async fn deploy(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;
        let mut function = self.load(owner, project_id, id).await?;

        if !can_deploy(&function) {
            return Err(LifecycleError::PreconditionFailed);
        }

        let id_str = id.to_string();
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), id_str.clone());

        self.substrate
            .create_deployment(&DeploymentSpec {
                name: id_str.clone(),
                labels: labels.clone(),
                image: crate::substrate::image_name(
                    &self.settings.registry,
                    &self.settings.registry_project,
                    &id_str,
                ),
                replicas: self.settings.replicas,
                container_port: self.settings.service_port,
            })
            .await?;
        self.substrate
            .create_service(&ServiceSpec {
                name: service_name(&self.settings.service_prefix, &id_str),
                selector: labels,
                port: self.settings.service_port,
            })
            .await?;
        info!(function_id = %id, "deployment and service created");

        function.deploy_status = DeployStatus::Deploying;
        function.deploy_fail_reason.clear();
        function.last_action = Action::Deploy;
        function.touch();
        self.functions.save(&function).await?;

        let result = watch_rollout(
            self.substrate.as_ref(),
            &id_str,
            self.settings.deploy_deadline(),
        )
        .await?;

        function.deploy_status = result.status;
        function.deploy_fail_reason = match result.status {
            DeployStatus::DeploymentFailed => result.reason,
            _ => String::new(),
        };
        function.touch();
        self.functions.save(&function).await?;
        info!(function_id = %id, status = ?function.deploy_status, "rollout finished");
        Ok(function)
    }

    /// Replace the function's source and rebuild its image. The running
    /// deployment keeps serving the old image until a redeploy; once the
    /// build resolves the record flips to `RedeployRequired`
    /// unconditionally, deployed before or not.
    pub async fn update(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
        code: &str,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;
        let mut function = self.load(owner, project_id, id).await?;

        function.code = code.to_string();
        function.last_action = Action::Update;
        self.run_build(&mut function).await?;

        function.deploy_status = DeployStatus::RedeployRequired;
        function.touch();
        self.functions.save(&function).await?;
        info!(function_id = %id, "function source updated and rebuilt");
        Ok(function)
    }

    /// Ask the substrate to replace the deployment's pods. Fire-and-forget:
    /// the rollout is not watched and the record's status triple is left
    /// as-is, so a further update-redeploy round stays valid.
    pub async fn redeploy(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<Function, LifecycleError> {
        self.gate(owner, project_id).await?;
        let mut function = self.load(owner, project_id, id).await?;

        if !can_redeploy(&function) {
            return Err(LifecycleError::PreconditionFailed);
        }

        self.substrate.trigger_rolling_update(&id.to_string()).await?;
        info!(function_id = %id, "rolling update triggered");

        function.touch();
        self.functions.save(&function).await?;
        Ok(function)
    }

    /// Tear down every substrate resource the function may own, then drop
    /// the record. Resources that were never created (or are already gone)
    /// are skipped.
    pub async fn delete(
        &self,
        owner: &str,
        project_id: &str,
        id: Uuid,
    ) -> Result<(), LifecycleError> {
        self.gate(owner, project_id).await?;
        let function = self.load(owner, project_id, id).await?;

        let id_str = id.to_string();
        for result in [
            self.substrate.delete_build_job(&build_job_name(&id_str)).await,
            self.substrate.delete_deployment(&id_str).await,
            self.substrate
                .delete_service(&service_name(&self.settings.service_prefix, &id_str))
                .await,
        ] {
            match result {
                Ok(()) | Err(SubstrateError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.functions.delete(function.id).await?;
        info!(function_id = %id, "function deleted");
        Ok(())
    }

    /// Create the capability gate for a project. Enabled from the start.
    pub async fn create_config(
        &self,
        owner: &str,
        project_id: &str,
    ) -> Result<ProjectConfig, LifecycleError> {
        let config = ProjectConfig::new(owner, project_id);
        self.configs.save(&config).await?;
        info!(owner, project_id, "project config created");
        Ok(config)
    }

    /// Flip a project's gate. The config must already exist.
    pub async fn set_config_enabled(
        &self,
        owner: &str,
        project_id: &str,
        enabled: bool,
    ) -> Result<ProjectConfig, LifecycleError> {
        let mut config = self
            .configs
            .get(owner, project_id)
            .await?
            .ok_or_else(|| LifecycleError::ConfigMissing(project_id.to_string()))?;
        config.enabled = enabled;
        self.configs.save(&config).await?;
        info!(owner, project_id, enabled, "project config toggled");
        Ok(config)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
