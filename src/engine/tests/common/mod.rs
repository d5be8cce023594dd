//! In-memory collaborators for exercising the build engine end to end.
//!
//! `MemImageStore` keeps the image chain in a map with deterministic
//! content-addressed IDs, `MockRuntime` backs every intermediate container
//! with a scratch rootfs directory, and `MockRegistry` simulates pulls by
//! seeding the store.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::sync::mpsc;

use kiln_core::config::RunConfig;
use kiln_core::error::{KilnError, Result};
use kiln_engine::registry::{AuthConfig, RegistryClient};
use kiln_engine::runtime::{ContainerRuntime, OutputChunk, StdStream};
use kiln_engine::store::{ImageRecord, ImageStore};
use kiln_engine::{BuildOptions, BuildOutput, Builder};

fn digest_of(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Initialize test logging once; honors RUST_LOG.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// --- Image store ---

#[derive(Default)]
pub struct MemImageStore {
    images: Mutex<HashMap<String, ImageRecord>>,
    names: Mutex<HashMap<String, String>>,
    commits: AtomicUsize,
}

impl MemImageStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a base image under `name`; returns its ID.
    pub fn seed(&self, name: &str, config: RunConfig) -> String {
        let id = digest_of(&format!("base:{}", name));
        let record = ImageRecord {
            id: id.clone(),
            parent: None,
            config: config.clone(),
            container_config: config,
            author: String::new(),
            created: Utc::now(),
        };
        self.images.lock().unwrap().insert(id.clone(), record);
        self.names.lock().unwrap().insert(name.to_string(), id.clone());
        id
    }

    pub fn record(&self, id: &str) -> Option<ImageRecord> {
        self.images.lock().unwrap().get(id).cloned()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageStore for MemImageStore {
    async fn lookup(&self, name: &str) -> Result<Option<ImageRecord>> {
        let id = self.names.lock().unwrap().get(name).cloned();
        let images = self.images.lock().unwrap();
        match id {
            Some(id) => Ok(images.get(&id).cloned()),
            // Fall back to raw IDs so FROM can reference a built image
            None => Ok(images.get(name).cloned()),
        }
    }

    async fn get_cached(&self, parent: &str, config: &RunConfig) -> Result<Option<ImageRecord>> {
        Ok(self
            .images
            .lock()
            .unwrap()
            .values()
            .find(|image| {
                image.parent.as_deref() == Some(parent) && &image.container_config == config
            })
            .cloned())
    }

    async fn commit(
        &self,
        _container_id: &str,
        author: &str,
        config: &RunConfig,
        container_config: &RunConfig,
    ) -> Result<ImageRecord> {
        let parent = container_config.image.clone();
        let fingerprint = serde_json::to_string(container_config)?;
        let persisted = serde_json::to_string(config)?;
        let id = digest_of(&format!("{}:{}:{}", parent, fingerprint, persisted));
        let record = ImageRecord {
            id: id.clone(),
            parent: Some(parent),
            config: config.clone(),
            container_config: container_config.clone(),
            author: author.to_string(),
            created: Utc::now(),
        };
        self.images.lock().unwrap().insert(id, record.clone());
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }
}

// --- Container runtime ---

struct MockContainer {
    config: RunConfig,
    rootfs: TempDir,
}

#[derive(Default)]
pub struct MockRuntime {
    counter: AtomicUsize,
    created: AtomicUsize,
    containers: Mutex<HashMap<String, MockContainer>>,
    exit_rules: Mutex<Vec<(String, i64)>>,
    output_rules: Mutex<Vec<(String, Vec<u8>)>>,
}

impl MockRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Containers whose command contains `pattern` exit with `code`.
    pub fn fail_when(&self, pattern: &str, code: i64) {
        self.exit_rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), code));
    }

    /// Containers whose command contains `pattern` emit `output` on stdout.
    pub fn emit_when(&self, pattern: &str, output: &[u8]) {
        self.output_rules
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_vec()));
    }

    /// Total `create` calls observed.
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// IDs of containers not yet destroyed.
    pub fn alive(&self) -> Vec<String> {
        self.containers.lock().unwrap().keys().cloned().collect()
    }

    pub fn alive_count(&self) -> usize {
        self.containers.lock().unwrap().len()
    }

    /// Rootfs paths of live containers, for inspecting materialized files.
    pub fn rootfs_paths(&self) -> Vec<PathBuf> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .map(|c| c.rootfs.path().to_path_buf())
            .collect()
    }

    /// Configs of every live container.
    pub fn live_configs(&self) -> Vec<RunConfig> {
        self.containers
            .lock()
            .unwrap()
            .values()
            .map(|c| c.config.clone())
            .collect()
    }

    fn command_line(&self, id: &str) -> String {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.config.cmd.join(" "))
            .unwrap_or_default()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn create(&self, config: &RunConfig) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let id = format!("{:064x}", n);
        let rootfs = TempDir::new()?;
        self.containers.lock().unwrap().insert(
            id.clone(),
            MockContainer {
                config: config.clone(),
                rootfs,
            },
        );
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn mount(&self, id: &str) -> Result<PathBuf> {
        self.containers
            .lock()
            .unwrap()
            .get(id)
            .map(|c| c.rootfs.path().to_path_buf())
            .ok_or_else(|| KilnError::MountFailed(format!("no such container: {}", id)))
    }

    async fn unmount(&self, _id: &str) -> Result<()> {
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        if self.containers.lock().unwrap().contains_key(id) {
            Ok(())
        } else {
            Err(KilnError::Other(format!("no such container: {}", id)))
        }
    }

    async fn attach(&self, id: &str) -> Result<mpsc::Receiver<OutputChunk>> {
        let (tx, rx) = mpsc::channel(4);
        let command = self.command_line(id);
        for (pattern, output) in self.output_rules.lock().unwrap().iter() {
            if command.contains(pattern.as_str()) {
                let _ = tx.try_send(OutputChunk {
                    stream: StdStream::Stdout,
                    data: output.clone(),
                });
            }
        }
        Ok(rx)
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let command = self.command_line(id);
        for (pattern, code) in self.exit_rules.lock().unwrap().iter() {
            if command.contains(pattern.as_str()) {
                return Ok(*code);
            }
        }
        Ok(0)
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        match self.containers.lock().unwrap().remove(id) {
            Some(_) => Ok(()),
            None => Err(KilnError::Other(format!("no such container: {}", id))),
        }
    }
}

// --- Registry ---

pub struct MockRegistry {
    store: Option<Arc<MemImageStore>>,
    available: Mutex<HashMap<String, RunConfig>>,
    pulls: Mutex<Vec<String>>,
}

impl MockRegistry {
    /// A registry holding nothing; every pull fails.
    pub fn unavailable() -> Arc<Self> {
        Arc::new(MockRegistry {
            store: None,
            available: Mutex::new(HashMap::new()),
            pulls: Mutex::new(Vec::new()),
        })
    }

    /// A registry that seeds `store` with published images on pull.
    pub fn with_store(store: Arc<MemImageStore>) -> Arc<Self> {
        Arc::new(MockRegistry {
            store: Some(store),
            available: Mutex::new(HashMap::new()),
            pulls: Mutex::new(Vec::new()),
        })
    }

    pub fn publish(&self, name: &str, config: RunConfig) {
        self.available
            .lock()
            .unwrap()
            .insert(name.to_string(), config);
    }

    pub fn pulls(&self) -> Vec<String> {
        self.pulls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistryClient for MockRegistry {
    async fn pull(&self, repository: &str, tag: &str, _auth: &AuthConfig) -> Result<()> {
        let reference = if tag.is_empty() {
            repository.to_string()
        } else {
            format!("{}:{}", repository, tag)
        };
        self.pulls.lock().unwrap().push(reference.clone());

        let published = self.available.lock().unwrap().get(&reference).cloned();
        match (published, &self.store) {
            (Some(config), Some(store)) => {
                store.seed(&reference, config);
                Ok(())
            }
            _ => Err(KilnError::PullFailed {
                image: reference,
                reason: "image not available".to_string(),
            }),
        }
    }
}

// --- Output capture ---

#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

// --- Harness ---

pub struct Harness {
    pub store: Arc<MemImageStore>,
    pub runtime: Arc<MockRuntime>,
    pub registry: Arc<MockRegistry>,
    pub output: SharedBuf,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        let store = MemImageStore::new();
        let registry = MockRegistry::with_store(store.clone());
        Harness {
            store,
            runtime: MockRuntime::new(),
            registry,
            output: SharedBuf::default(),
        }
    }

    pub fn builder(&self) -> Builder {
        self.builder_with(BuildOptions::default())
    }

    pub fn builder_with(&self, options: BuildOptions) -> Builder {
        Builder::new(
            self.store.clone(),
            self.runtime.clone(),
            self.registry.clone(),
            BuildOutput::plain(self.output.clone()),
            options,
        )
    }

    pub fn output_text(&self) -> String {
        self.output.contents()
    }
}

// --- Context archives ---

/// Build an uncompressed tar context from (path, content) pairs.
pub fn tar_context(files: &[(&str, &str)]) -> Vec<u8> {
    tar_context_bytes(
        &files
            .iter()
            .map(|(name, content)| (*name, content.as_bytes().to_vec()))
            .collect::<Vec<_>>(),
    )
}

pub fn tar_context_bytes(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &content[..]).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Tar context including a symlink entry.
pub fn tar_context_with_symlink(
    files: &[(&str, &str)],
    link_name: &str,
    link_target: &str,
) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, content.as_bytes())
            .unwrap();
    }
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Symlink);
    header.set_size(0);
    header.set_cksum();
    builder.append_link(&mut header, link_name, link_target).unwrap();
    builder.into_inner().unwrap()
}

/// Serve `body` for a single HTTP request; returns the base URL.
pub async fn serve_once(body: Vec<u8>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = socket.write_all(header.as_bytes()).await;
            let _ = socket.write_all(&body).await;
            let _ = socket.shutdown().await;
        }
    });
    format!("http://{}", addr)
}
