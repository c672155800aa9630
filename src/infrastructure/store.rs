//! Desired-state and job stores
//!
//! [`StateStore`] holds services and applications, the desired state the
//! control plane reconciles towards. [`JobStore`] holds background job
//! records. Both are injected as trait objects.

use async_trait::async_trait;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::domain::{Application, BackgroundJob, KubernetesDeploymentInfo, Service};
use crate::error::{NotFoundError, StoreError};

/// Persistence of services and applications
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get_application(&self, short_name: &str, version: &str)
        -> Result<Application, StoreError>;
    /// Insert or replace; mints instance ids for new deployment records
    #[allow(dead_code)]
    async fn save_application(&self, application: Application) -> Result<Application, StoreError>;

    async fn get_service(&self, short_name: &str, version: &str) -> Result<Service, StoreError>;
    #[allow(dead_code)]
    async fn save_service(&self, service: Service) -> Result<Service, StoreError>;

    async fn update_service_image(
        &self,
        short_name: &str,
        version: &str,
        image: &str,
    ) -> Result<(), StoreError>;

    /// Set or clear the actual-state record of a service instance
    async fn update_kubernetes_deployment_info(
        &self,
        instance_id: &str,
        info: Option<KubernetesDeploymentInfo>,
    ) -> Result<(), StoreError>;
}

/// Serialized form of all desired state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub applications: Vec<Application>,
}

impl StateSnapshot {
    fn mint_instance_ids(application: &mut Application) {
        let name = application.to_string();
        for info in &mut application.services {
            if info.ensure_instance_id() {
                debug!(
                    "Minted instance id {} for {} in {}",
                    info.instance_id, info.service, name
                );
            }
        }
    }

    fn mint_all_instance_ids(&mut self) {
        for application in &mut self.applications {
            Self::mint_instance_ids(application);
        }
    }

    fn application(&self, short_name: &str, version: &str) -> Result<Application, StoreError> {
        self.applications
            .iter()
            .find(|a| a.short_name == short_name && a.version == version)
            .cloned()
            .ok_or_else(|| {
                NotFoundError::Application {
                    short_name: short_name.to_string(),
                    version: version.to_string(),
                }
                .into()
            })
    }

    fn service(&self, short_name: &str, version: &str) -> Result<Service, StoreError> {
        self.services
            .iter()
            .find(|s| s.short_name == short_name && s.version == version)
            .cloned()
            .ok_or_else(|| {
                NotFoundError::Service {
                    short_name: short_name.to_string(),
                    version: version.to_string(),
                }
                .into()
            })
    }

    fn save_application(&mut self, mut application: Application) -> Application {
        Self::mint_instance_ids(&mut application);
        match self
            .applications
            .iter_mut()
            .find(|a| a.short_name == application.short_name && a.version == application.version)
        {
            Some(existing) => *existing = application.clone(),
            None => self.applications.push(application.clone()),
        }
        application
    }

    fn save_service(&mut self, service: Service) -> Service {
        match self
            .services
            .iter_mut()
            .find(|s| s.short_name == service.short_name && s.version == service.version)
        {
            Some(existing) => *existing = service.clone(),
            None => self.services.push(service.clone()),
        }
        service
    }

    fn update_service_image(
        &mut self,
        short_name: &str,
        version: &str,
        image: &str,
    ) -> Result<(), StoreError> {
        let service = self
            .services
            .iter_mut()
            .find(|s| s.short_name == short_name && s.version == version)
            .ok_or_else(|| NotFoundError::Service {
                short_name: short_name.to_string(),
                version: version.to_string(),
            })?;
        service.image = Some(image.to_string());
        Ok(())
    }

    fn update_kubernetes_deployment_info(
        &mut self,
        instance_id: &str,
        info: Option<KubernetesDeploymentInfo>,
    ) -> Result<(), StoreError> {
        let deployment = self
            .applications
            .iter_mut()
            .find_map(|a| a.instance_mut(instance_id))
            .ok_or_else(|| NotFoundError::Instance {
                instance_id: instance_id.to_string(),
            })?;
        deployment.kubernetes_deployment_info = info;
        Ok(())
    }
}

/// [`StateStore`] kept in memory
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryStateStore {
    state: RwLock<StateSnapshot>,
}

impl InMemoryStateStore {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn from_snapshot(mut snapshot: StateSnapshot) -> Self {
        snapshot.mint_all_instance_ids();
        Self {
            state: RwLock::new(snapshot),
        }
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<Application, StoreError> {
        self.state.read().await.application(short_name, version)
    }

    async fn save_application(&self, application: Application) -> Result<Application, StoreError> {
        Ok(self.state.write().await.save_application(application))
    }

    async fn get_service(&self, short_name: &str, version: &str) -> Result<Service, StoreError> {
        self.state.read().await.service(short_name, version)
    }

    async fn save_service(&self, service: Service) -> Result<Service, StoreError> {
        Ok(self.state.write().await.save_service(service))
    }

    async fn update_service_image(
        &self,
        short_name: &str,
        version: &str,
        image: &str,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .update_service_image(short_name, version, image)
    }

    async fn update_kubernetes_deployment_info(
        &self,
        instance_id: &str,
        info: Option<KubernetesDeploymentInfo>,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .update_kubernetes_deployment_info(instance_id, info)
    }
}

/// A YAML document that several processes may read and change
///
/// Writers replace the file atomically, so readers always see a whole
/// document. Every change holds an advisory lock on a sidecar `.lock` file
/// and re-reads the document under it, so no process writes back a stale
/// copy.
struct SharedYamlFile {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
}

impl SharedYamlFile {
    fn new(path: PathBuf) -> Self {
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            local: Mutex::new(()),
        }
    }

    fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Current document; a missing or empty file is the default document
    async fn load<T: DeserializeOwned + Default>(&self) -> Result<T, StoreError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(StoreError::Read {
                    path: self.path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };
        if content.trim().is_empty() {
            return Ok(T::default());
        }
        serde_yaml::from_str(&content).map_err(|e| StoreError::Parse {
            message: format!("{}: {}", self.path.display(), e),
        })
    }

    /// Blocks until no other process holds the lock; closing the returned
    /// file releases it
    async fn lock(&self) -> Result<std::fs::File, StoreError> {
        let lock_path = self.lock_path.clone();
        let locked = tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            file.lock_exclusive()?;
            Ok::<_, std::io::Error>(file)
        })
        .await;

        let write_error = |message: String| StoreError::Write {
            path: self.lock_path.display().to_string(),
            message,
        };
        match locked {
            Ok(Ok(file)) => Ok(file),
            Ok(Err(e)) => Err(write_error(e.to_string())),
            Err(e) => Err(write_error(e.to_string())),
        }
    }

    /// Re-read, change and write back the document as one step
    async fn update<T, R>(
        &self,
        change: impl FnOnce(&mut T) -> Result<R, StoreError>,
    ) -> Result<R, StoreError>
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let _local = self.local.lock().await;
        let lock = self.lock().await?;

        let mut document: T = self.load().await?;
        let result = change(&mut document)?;
        let content = serde_yaml::to_string(&document).map_err(|e| StoreError::Parse {
            message: e.to_string(),
        })?;
        write_atomically(&self.path, &content)?;

        if let Err(e) = FileExt::unlock(&lock) {
            debug!("Failed to unlock {}: {}", self.lock_path.display(), e);
        }
        Ok(result)
    }
}

fn write_atomically(path: &Path, content: &str) -> Result<(), StoreError> {
    let write_error = |message: String| StoreError::Write {
        path: path.display().to_string(),
        message,
    };
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(|e| write_error(e.to_string()))?;
    file.write_all(content.as_bytes())
        .map_err(|e| write_error(e.to_string()))?;
    file.persist(path)
        .map_err(|e| write_error(e.error.to_string()))?;
    Ok(())
}

/// [`StateStore`] backed by a YAML file shared with other processes
pub struct FileStateStore {
    file: SharedYamlFile,
}

impl FileStateStore {
    /// Open a state file; a missing file starts empty
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = SharedYamlFile::new(path.as_ref().to_path_buf());
        if !file.exists() {
            info!("State file {} does not exist, starting empty", file.path.display());
        }

        // Persist ids of deployment records written without one
        file.update(|snapshot: &mut StateSnapshot| {
            snapshot.mint_all_instance_ids();
            Ok(())
        })
        .await?;
        Ok(Self { file })
    }

    async fn snapshot(&self) -> Result<StateSnapshot, StoreError> {
        self.file.load().await
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn get_application(
        &self,
        short_name: &str,
        version: &str,
    ) -> Result<Application, StoreError> {
        self.snapshot().await?.application(short_name, version)
    }

    async fn save_application(&self, application: Application) -> Result<Application, StoreError> {
        self.file
            .update(|snapshot: &mut StateSnapshot| Ok(snapshot.save_application(application)))
            .await
    }

    async fn get_service(&self, short_name: &str, version: &str) -> Result<Service, StoreError> {
        self.snapshot().await?.service(short_name, version)
    }

    async fn save_service(&self, service: Service) -> Result<Service, StoreError> {
        self.file
            .update(|snapshot: &mut StateSnapshot| Ok(snapshot.save_service(service)))
            .await
    }

    async fn update_service_image(
        &self,
        short_name: &str,
        version: &str,
        image: &str,
    ) -> Result<(), StoreError> {
        self.file
            .update(|snapshot: &mut StateSnapshot| {
                snapshot.update_service_image(short_name, version, image)
            })
            .await
    }

    async fn update_kubernetes_deployment_info(
        &self,
        instance_id: &str,
        info: Option<KubernetesDeploymentInfo>,
    ) -> Result<(), StoreError> {
        self.file
            .update(|snapshot: &mut StateSnapshot| {
                snapshot.update_kubernetes_deployment_info(instance_id, info)
            })
            .await
    }
}

/// Persistence of background job records
#[async_trait]
pub trait JobStore: Send + Sync {
    /// All jobs, oldest first
    async fn list(&self) -> Result<Vec<BackgroundJob>, StoreError>;

    /// Apply `change` to the job records as one atomic step. Other writers,
    /// in this process or another, see either all of it or none of it.
    async fn update(
        &self,
        change: &mut (dyn for<'a> FnMut(&'a mut Vec<BackgroundJob>) + Send),
    ) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(self.list().await?.into_iter().find(|j| j.id == id))
    }
}

fn sort_jobs(jobs: &mut [BackgroundJob]) {
    jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
}

/// [`JobStore`] kept in memory
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<Vec<BackgroundJob>>,
}

impl InMemoryJobStore {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn list(&self) -> Result<Vec<BackgroundJob>, StoreError> {
        let mut jobs = self.jobs.read().await.clone();
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    async fn update(
        &self,
        change: &mut (dyn for<'a> FnMut(&'a mut Vec<BackgroundJob>) + Send),
    ) -> Result<(), StoreError> {
        change(&mut *self.jobs.write().await);
        Ok(())
    }
}

/// [`JobStore`] backed by a YAML file, so job records outlive the process
/// that ran them and a job can be cancelled from another process
pub struct FileJobStore {
    file: SharedYamlFile,
}

impl FileJobStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = SharedYamlFile::new(path.as_ref().to_path_buf());
        let jobs: Vec<BackgroundJob> = file.load().await?;
        debug!("Found {} jobs in {}", jobs.len(), file.path.display());
        Ok(Self { file })
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn list(&self) -> Result<Vec<BackgroundJob>, StoreError> {
        let mut jobs: Vec<BackgroundJob> = self.file.load().await?;
        sort_jobs(&mut jobs);
        Ok(jobs)
    }

    async fn update(
        &self,
        change: &mut (dyn for<'a> FnMut(&'a mut Vec<BackgroundJob>) + Send),
    ) -> Result<(), StoreError> {
        self.file
            .update(|jobs: &mut Vec<BackgroundJob>| {
                change(jobs);
                sort_jobs(jobs);
                Ok(())
            })
            .await
    }
}
