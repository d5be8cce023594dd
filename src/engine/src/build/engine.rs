//! Recipe driver, instruction dispatch, and handlers.
//!
//! `Builder` threads a single mutable state record through every step:
//! the current top-of-chain image, the run configuration, and the set of
//! intermediate containers awaiting cleanup. Each instruction either
//! mutates configuration and commits a metadata-only layer, or runs a
//! command in a fresh container and commits its filesystem. Before any
//! container is created the step is fingerprinted against the image store;
//! a hit advances the chain without touching the runtime.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;

use kiln_core::config::{PortSpec, RunConfig};
use kiln_core::error::{KilnError, Result};

use crate::registry::{parse_repository_tag, AuthConfig, RegistryClient};
use crate::runtime::ContainerRuntime;
use crate::store::{short_id, ImageStore};

use super::context::{copy_tree, fix_permissions, scoped_join, try_untar, BuildContext};
use super::interpolate::substitute_env;
use super::output::BuildOutput;
use super::recipe::{logical_lines, split_instruction};
use super::remote;
use super::tarsum;

/// PATH seeded into configs whose base image carries no environment.
pub const DEFAULT_PATH_ENV: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Policy knobs threaded through a single build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Probe the image store before executing each step
    pub use_cache: bool,
    /// Destroy intermediate containers after each successful step
    pub remove_intermediates: bool,
    /// Destroy intermediate containers even when a step fails
    pub force_remove_intermediates: bool,
    /// Emit per-step progress and stream RUN output
    pub verbose: bool,
    /// Credentials for pulling a missing base image
    pub auth: AuthConfig,
    /// PATH value seeded when the base image has an empty environment
    pub default_path_env: String,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            use_cache: true,
            remove_intermediates: false,
            force_remove_intermediates: false,
            verbose: true,
            auth: AuthConfig::default(),
            default_path_env: DEFAULT_PATH_ENV.to_string(),
        }
    }
}

/// One recognized recipe instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    From,
    Maintainer,
    Run,
    Cmd,
    Entrypoint,
    Env,
    Expose,
    User,
    Workdir,
    Volume,
    Copy,
    Add,
    Onbuild,
    Insert,
}

impl Instruction {
    /// Case-insensitive keyword lookup. Unknown keywords are skipped by
    /// the driver rather than failing the build.
    pub fn parse(keyword: &str) -> Option<Self> {
        match keyword.to_uppercase().as_str() {
            "FROM" => Some(Instruction::From),
            "MAINTAINER" => Some(Instruction::Maintainer),
            "RUN" => Some(Instruction::Run),
            "CMD" => Some(Instruction::Cmd),
            "ENTRYPOINT" => Some(Instruction::Entrypoint),
            "ENV" => Some(Instruction::Env),
            "EXPOSE" => Some(Instruction::Expose),
            "USER" => Some(Instruction::User),
            "WORKDIR" => Some(Instruction::Workdir),
            "VOLUME" => Some(Instruction::Volume),
            "COPY" => Some(Instruction::Copy),
            "ADD" => Some(Instruction::Add),
            "ONBUILD" => Some(Instruction::Onbuild),
            "INSERT" => Some(Instruction::Insert),
            _ => None,
        }
    }

    /// Canonical upper-case keyword.
    pub fn name(&self) -> &'static str {
        match self {
            Instruction::From => "FROM",
            Instruction::Maintainer => "MAINTAINER",
            Instruction::Run => "RUN",
            Instruction::Cmd => "CMD",
            Instruction::Entrypoint => "ENTRYPOINT",
            Instruction::Env => "ENV",
            Instruction::Expose => "EXPOSE",
            Instruction::User => "USER",
            Instruction::Workdir => "WORKDIR",
            Instruction::Volume => "VOLUME",
            Instruction::Copy => "COPY",
            Instruction::Add => "ADD",
            Instruction::Onbuild => "ONBUILD",
            Instruction::Insert => "INSERT",
        }
    }
}

/// The build engine: interprets one recipe against one context.
pub struct Builder {
    store: Arc<dyn ImageStore>,
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<dyn RegistryClient>,
    output: BuildOutput,
    options: BuildOptions,

    /// Current top-of-chain image; empty until FROM succeeds
    image: String,
    /// Run configuration carried into the next commit
    config: RunConfig,
    /// Author recorded on committed images
    maintainer: String,
    /// Whether CMD appeared in this recipe (drives ENTRYPOINT's clearing)
    cmd_set: bool,
    /// Extracted context; present only while a build is running
    context: Option<BuildContext>,
    /// Intermediate containers awaiting cleanup
    tmp_containers: HashSet<String>,
    /// Images committed during this build
    tmp_images: HashSet<String>,
}

impl Builder {
    pub fn new(
        store: Arc<dyn ImageStore>,
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<dyn RegistryClient>,
        output: BuildOutput,
        options: BuildOptions,
    ) -> Self {
        Builder {
            store,
            runtime,
            registry,
            output,
            options,
            image: String::new(),
            config: RunConfig::default(),
            maintainer: String::new(),
            cmd_set: false,
            context: None,
            tmp_containers: HashSet::new(),
            tmp_images: HashSet::new(),
        }
    }

    /// Intermediate containers still tracked by this build.
    pub fn intermediate_containers(&self) -> &HashSet<String> {
        &self.tmp_containers
    }

    /// Images committed during this build.
    pub fn intermediate_images(&self) -> &HashSet<String> {
        &self.tmp_images
    }

    /// Run a full build over the given context archive stream. Returns
    /// the final image ID.
    pub async fn build<R: Read>(&mut self, input: R) -> Result<String> {
        let context = BuildContext::unpack(input)?;
        let recipe_path = context.root().join("Dockerfile");
        let text = match std::fs::read_to_string(&recipe_path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(KilnError::EmptyRecipe)
            }
            Err(err) => return Err(err.into()),
        };
        if text.is_empty() {
            return Err(KilnError::EmptyRecipe);
        }

        self.context = Some(context);
        let result = self.run_recipe(&text).await;
        // The sandbox is removed here, success or failure
        self.context = None;
        result
    }

    async fn run_recipe(&mut self, text: &str) -> Result<String> {
        let lines = logical_lines(text);
        for (step, line) in lines.iter().enumerate() {
            let name = step.to_string();
            if let Err(err) = self.build_step(&name, line).await {
                if self.options.force_remove_intermediates {
                    self.clear_tmp().await;
                }
                return Err(err);
            }
            if self.options.remove_intermediates {
                self.clear_tmp().await;
            }
        }
        if self.image.is_empty() {
            return Err(KilnError::NoImageProduced);
        }
        self.output
            .line(format!("Successfully built {}", short_id(&self.image)));
        Ok(self.image.clone())
    }

    /// Execute one step: banner, dispatch, progress marker.
    ///
    /// Boxed because FROM replays ONBUILD triggers through this same
    /// entry point.
    fn build_step<'a>(&'a mut self, name: &'a str, expression: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.options.verbose {
                self.output.line(format!("Step {} : {}", name, expression));
            }
            let Some((keyword, arguments)) = split_instruction(expression) else {
                return Err(KilnError::InvalidFormat("Dockerfile".to_string()));
            };
            let Some(instruction) = Instruction::parse(keyword) else {
                tracing::warn!(instruction = keyword, "skipping unknown instruction");
                self.output.line(format!(
                    "# Skipping unknown instruction {}",
                    keyword.to_uppercase()
                ));
                return Ok(());
            };
            self.dispatch(instruction, arguments).await?;
            if self.options.verbose {
                self.output.line(format!(" ---> {}", short_id(&self.image)));
            }
            Ok(())
        })
    }

    async fn dispatch(&mut self, instruction: Instruction, arguments: &str) -> Result<()> {
        match instruction {
            Instruction::From => self.cmd_from(arguments).await,
            Instruction::Maintainer => self.cmd_maintainer(arguments).await,
            Instruction::Run => self.cmd_run(arguments).await,
            Instruction::Cmd => self.cmd_cmd(arguments).await,
            Instruction::Entrypoint => self.cmd_entrypoint(arguments).await,
            Instruction::Env => self.cmd_env(arguments).await,
            Instruction::Expose => self.cmd_expose(arguments).await,
            Instruction::User => self.cmd_user(arguments).await,
            Instruction::Workdir => self.cmd_workdir(arguments).await,
            Instruction::Volume => self.cmd_volume(arguments).await,
            Instruction::Copy => self.cmd_copy(arguments).await,
            Instruction::Add => self.cmd_add(arguments).await,
            Instruction::Onbuild => self.cmd_onbuild(arguments).await,
            Instruction::Insert => self.cmd_insert(arguments).await,
        }
    }

    // --- Instruction handlers ---

    /// FROM: resolve (pulling if missing), reset config from the image,
    /// then replay any ONBUILD triggers. Never commits.
    async fn cmd_from(&mut self, args: &str) -> Result<()> {
        let name = args.trim();
        let image = match self.store.lookup(name).await? {
            Some(image) => image,
            None => {
                let (repository, tag) = parse_repository_tag(name);
                self.registry
                    .pull(&repository, &tag, &self.options.auth)
                    .await?;
                self.store
                    .lookup(name)
                    .await?
                    .ok_or_else(|| KilnError::ImageNotFound(name.to_string()))?
            }
        };
        self.image = image.id.clone();
        self.config = image.config.clone();
        if self.config.env.is_empty() {
            self.config
                .env
                .push(format!("PATH={}", self.options.default_path_env));
        }

        // Triggers are replayed against this build and must not be
        // re-committed into the child image.
        let triggers = std::mem::take(&mut self.config.on_build);
        if !triggers.is_empty() {
            self.output
                .line(format!("# Executing {} build triggers", triggers.len()));
        }
        for (n, trigger) in triggers.iter().enumerate() {
            let head = trigger
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_uppercase();
            match head.as_str() {
                "ONBUILD" => {
                    return Err(KilnError::InvalidTrigger(format!(
                        "source image contains forbidden chained `ONBUILD ONBUILD` trigger: {}",
                        trigger
                    )))
                }
                "MAINTAINER" | "FROM" => {
                    return Err(KilnError::InvalidTrigger(format!(
                        "source image contains forbidden {} trigger: {}",
                        head, trigger
                    )))
                }
                _ => {}
            }
            let step_name = format!("onbuild-{}", n);
            self.build_step(&step_name, trigger).await?;
        }
        Ok(())
    }

    async fn cmd_maintainer(&mut self, args: &str) -> Result<()> {
        self.maintainer = args.trim().to_string();
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("MAINTAINER {}", self.maintainer);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_run(&mut self, args: &str) -> Result<()> {
        if self.image.is_empty() {
            return Err(KilnError::NoBaseImage("RUN".to_string()));
        }
        let saved_cmd = self.config.cmd.clone();
        self.config.cmd = exec_form(args);
        tracing::debug!(cmd = ?self.config.cmd, "command to be executed");
        let outcome = self.exec_run(saved_cmd.clone()).await;
        self.config.cmd = saved_cmd;
        outcome
    }

    async fn exec_run(&mut self, auto_cmd: Vec<String>) -> Result<()> {
        if self.probe_cache().await? {
            return Ok(());
        }
        let container = self.create_container().await?;
        // Keep the container mounted from run through commit
        self.runtime.mount(&container).await?;
        let ran = self.stream_run(&container).await;
        let committed = match ran {
            Ok(()) => self.commit(Some(container.clone()), auto_cmd, "run").await,
            Err(err) => Err(err),
        };
        let _ = self.runtime.unmount(&container).await;
        committed
    }

    async fn stream_run(&mut self, container: &str) -> Result<()> {
        let attached = if self.options.verbose {
            Some(self.runtime.attach(container).await?)
        } else {
            None
        };
        self.runtime.start(container).await?;
        if let Some(mut chunks) = attached {
            while let Some(chunk) = chunks.recv().await {
                self.output.raw(&chunk.data);
            }
        }
        let code = self.runtime.wait(container).await?;
        if code != 0 {
            return Err(KilnError::RunFailed {
                cmd: format!("{:?}", self.config.cmd),
                code,
            });
        }
        Ok(())
    }

    async fn cmd_cmd(&mut self, args: &str) -> Result<()> {
        let cmd = exec_form(args);
        self.config.cmd = cmd.clone();
        let comment = format!("CMD {:?}", cmd);
        self.commit(None, cmd, &comment).await?;
        self.cmd_set = true;
        Ok(())
    }

    async fn cmd_entrypoint(&mut self, args: &str) -> Result<()> {
        self.config.entrypoint = exec_form(args);
        // An entrypoint inheriting the base image's CMD is almost always
        // wrong; only a CMD from this recipe survives.
        if !self.cmd_set {
            self.config.cmd = Vec::new();
        }
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("ENTRYPOINT {:?}", self.config.entrypoint);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_env(&mut self, args: &str) -> Result<()> {
        let Some((key, value)) = split_instruction(args) else {
            return Err(KilnError::InvalidFormat("ENV".to_string()));
        };
        let value = substitute_env(value.trim(), &self.config.env);
        self.config.set_env(key.trim(), &value);
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("ENV {}", args.trim());
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_expose(&mut self, args: &str) -> Result<()> {
        let mut ports = Vec::new();
        for token in args.split_whitespace() {
            ports.push(token.parse::<PortSpec>()?);
        }
        for port in &ports {
            self.config.exposed_ports.insert(*port);
        }
        let listed: Vec<String> = ports.iter().map(PortSpec::to_string).collect();
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("EXPOSE {}", listed.join(" "));
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_user(&mut self, args: &str) -> Result<()> {
        self.config.user = args.trim().to_string();
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("USER {}", self.config.user);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_workdir(&mut self, args: &str) -> Result<()> {
        let dir = args.trim();
        if dir.starts_with('/') {
            self.config.working_dir = dir.to_string();
        } else {
            if self.config.working_dir.is_empty() {
                self.config.working_dir = "/".to_string();
            }
            self.config.working_dir = format!(
                "{}/{}",
                self.config.working_dir.trim_end_matches('/'),
                dir
            );
        }
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("WORKDIR {}", dir);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_volume(&mut self, args: &str) -> Result<()> {
        let args = args.trim();
        if args.is_empty() {
            return Err(KilnError::InvalidArgument(
                "volume cannot be empty".to_string(),
            ));
        }
        let volumes: Vec<String> =
            serde_json::from_str(args).unwrap_or_else(|_| vec![args.to_string()]);
        for volume in volumes {
            self.config.volumes.insert(volume);
        }
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("VOLUME {}", args);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_copy(&mut self, args: &str) -> Result<()> {
        self.context_command(args, false, false, "COPY").await
    }

    async fn cmd_add(&mut self, args: &str) -> Result<()> {
        self.context_command(args, true, true, "ADD").await
    }

    /// ONBUILD: defer an instruction into the committed image's config.
    async fn cmd_onbuild(&mut self, args: &str) -> Result<()> {
        let trigger = args.trim();
        let head = trigger
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_uppercase();
        match head.as_str() {
            "ONBUILD" => {
                return Err(KilnError::InvalidTrigger(
                    "chaining ONBUILD via `ONBUILD ONBUILD` isn't allowed".to_string(),
                ))
            }
            "MAINTAINER" | "FROM" => {
                return Err(KilnError::InvalidTrigger(format!(
                    "{} isn't allowed as an ONBUILD trigger",
                    head
                )))
            }
            _ => {}
        }
        self.config.on_build.push(trigger.to_string());
        let auto_cmd = self.config.cmd.clone();
        let comment = format!("ONBUILD {}", trigger);
        self.commit(None, auto_cmd, &comment).await
    }

    async fn cmd_insert(&mut self, _args: &str) -> Result<()> {
        Err(KilnError::Deprecated(
            "INSERT has been deprecated; use ADD instead".to_string(),
        ))
    }

    // --- Context-file command (COPY/ADD) ---

    async fn context_command(
        &mut self,
        args: &str,
        allow_remote: bool,
        allow_decompression: bool,
        cmd_name: &str,
    ) -> Result<()> {
        if self.context.is_none() {
            return Err(KilnError::InvalidArgument(format!(
                "no context given; cannot use {}",
                cmd_name
            )));
        }
        let Some((orig_raw, dest_raw)) = split_instruction(args) else {
            return Err(KilnError::InvalidFormat(cmd_name.to_string()));
        };
        let orig = substitute_env(orig_raw.trim(), &self.config.env);
        let dest = substitute_env(dest_raw.trim(), &self.config.env);

        let saved_cmd = self.config.cmd.clone();
        let outcome = self
            .exec_context_command(
                &orig,
                &dest,
                allow_remote,
                allow_decompression,
                cmd_name,
                saved_cmd.clone(),
            )
            .await;
        self.config.cmd = saved_cmd;
        outcome
    }

    async fn exec_context_command(
        &mut self,
        orig: &str,
        dest: &str,
        allow_remote: bool,
        allow_decompression: bool,
        cmd_name: &str,
        auto_cmd: Vec<String>,
    ) -> Result<()> {
        self.config.image = self.image.clone();
        self.config.cmd = nop_cmd(&format!("{} {} in {}", cmd_name, orig, dest));

        let is_remote = remote::is_url(orig);
        if is_remote && !allow_remote {
            return Err(KilnError::InvalidArgument(format!(
                "source can't be a URL for {}",
                cmd_name
            )));
        }

        let mut orig_path = orig.to_string();
        let mut dest_path = dest.to_string();
        let mut remote_sum = String::new();
        let mut remote_file = None;

        if is_remote {
            let root = match self.context.as_ref() {
                Some(context) => context.root().to_path_buf(),
                None => return Err(KilnError::InvalidArgument("no build context".to_string())),
            };
            let downloaded = remote::download_to(orig, &root).await?;
            remote_sum = tarsum::file_sum("tmp", &downloaded.path())?;
            orig_path = downloaded.rel.clone();
            if dest.ends_with('/') {
                dest_path = format!("{}{}", dest, remote::filename_from_url(orig)?);
            }
            remote_file = Some(downloaded);
        }

        // Local-source validation: symlink-evaluated, in-sandbox, existing
        {
            let Some(context) = self.context.as_ref() else {
                return Err(KilnError::InvalidArgument("no build context".to_string()));
            };
            context.resolve_source(&orig_path)?;
        }

        if self.options.use_cache {
            let hash = {
                let Some(context) = self.context.as_ref() else {
                    return Err(KilnError::InvalidArgument("no build context".to_string()));
                };
                let resolved = context.resolve_source(&orig_path)?;
                if !remote_sum.is_empty() {
                    remote_sum.clone()
                } else if resolved.is_dir() {
                    context.dir_sum(&orig_path)
                } else {
                    context
                        .sum_for(&orig_path)
                        .map(|sum| format!("file:{}", sum))
                        .unwrap_or_default()
                }
            };
            // A step with no content hash can never be trusted from cache
            if !hash.is_empty() {
                self.config.cmd = nop_cmd(&format!("{} {} in {}", cmd_name, hash, dest));
                if self.probe_cache().await? {
                    return Ok(());
                }
            }
        }

        let container = self.create_container().await?;
        let rootfs = self.runtime.mount(&container).await?;
        let decompress = allow_decompression && !is_remote;
        let added = self.add_context(&rootfs, &orig_path, &dest_path, decompress);
        let committed = match added {
            Ok(()) => {
                let comment = format!("{} {} in {}", cmd_name, orig, dest);
                self.commit(Some(container.clone()), auto_cmd, &comment).await
            }
            Err(err) => Err(err),
        };
        let _ = self.runtime.unmount(&container).await;
        drop(remote_file);
        committed
    }

    /// Materialize a context file into a mounted container rootfs.
    fn add_context(
        &self,
        rootfs: &Path,
        orig_path: &str,
        dest_path: &str,
        decompress: bool,
    ) -> Result<()> {
        let Some(context) = self.context.as_ref() else {
            return Err(KilnError::InvalidArgument("no build context".to_string()));
        };
        let src = context.resolve_source(orig_path)?;
        let mut dst = scoped_join(rootfs, dest_path)?;
        let dir_semantics = dest_path.ends_with('/') || dest_path == ".";
        let dest_is_dir = std::fs::metadata(&dst).map(|m| m.is_dir()).unwrap_or(false);

        if src.is_dir() {
            copy_tree(&src, &dst)?;
            fix_permissions(&dst, 0, 0)?;
            return Ok(());
        }

        if decompress {
            let tar_dest = if dir_semantics {
                dst.clone()
            } else {
                dst.parent()
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| rootfs.to_path_buf())
            };
            if try_untar(&src, &tar_dest)? {
                return Ok(());
            }
        }

        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if dir_semantics || dest_is_dir {
            std::fs::create_dir_all(&dst)?;
            let name = src
                .file_name()
                .ok_or_else(|| KilnError::PathNotFound(orig_path.to_string()))?;
            dst = dst.join(name);
        }
        std::fs::copy(&src, &dst)?;
        fix_permissions(&dst, 0, 0)?;
        Ok(())
    }

    // --- Cache, commit, cleanup ---

    /// Probe the store for a cached child of the current image matching
    /// the current configuration. A hit advances the chain.
    async fn probe_cache(&mut self) -> Result<bool> {
        if !self.options.use_cache {
            return Ok(false);
        }
        self.config.image = self.image.clone();
        match self.store.get_cached(&self.image, &self.config).await? {
            Some(cached) => {
                if self.options.verbose {
                    self.output.line(" ---> Using cache");
                }
                tracing::debug!(image = %cached.id, "build cache hit");
                self.image = cached.id;
                Ok(true)
            }
            None => {
                tracing::debug!("build cache miss");
                Ok(false)
            }
        }
    }

    /// Create an intermediate container from the current configuration.
    async fn create_container(&mut self) -> Result<String> {
        if self.image.is_empty() {
            return Err(KilnError::NoBaseImage("create".to_string()));
        }
        self.config.image = self.image.clone();
        let id = self.runtime.create(&self.config).await?;
        self.tmp_containers.insert(id.clone());
        if self.options.verbose {
            self.output.line(format!(" ---> Running in {}", short_id(&id)));
        }
        Ok(id)
    }

    /// Commit the current configuration (and optionally a container's
    /// filesystem) as the next image in the chain.
    ///
    /// Metadata-only steps pass `None`: the fingerprint becomes the
    /// synthetic `#(nop) <comment>` command, and on a cache miss a
    /// container is created purely for snapshotting. `auto_cmd` is the
    /// semantically meaningful command persisted into the image.
    async fn commit(
        &mut self,
        container: Option<String>,
        auto_cmd: Vec<String>,
        comment: &str,
    ) -> Result<()> {
        if self.image.is_empty() {
            return Err(KilnError::NoBaseImage("commit".to_string()));
        }
        self.config.image = self.image.clone();

        let (container, fingerprint) = match container {
            Some(id) => (id, self.config.clone()),
            None => {
                let saved_cmd = std::mem::replace(&mut self.config.cmd, nop_cmd(comment));
                let snapshot = self.snapshot_container().await;
                let fingerprint = self.config.clone();
                self.config.cmd = saved_cmd;
                match snapshot? {
                    None => return Ok(()),
                    Some(id) => (id, fingerprint),
                }
            }
        };

        let mut run_config = fingerprint.clone();
        run_config.cmd = auto_cmd;
        let image = self
            .store
            .commit(&container, &self.maintainer, &run_config, &fingerprint)
            .await?;
        self.tmp_images.insert(image.id.clone());
        self.image = image.id;
        Ok(())
    }

    /// Probe for a cached metadata-only step; on miss, create a container
    /// purely to snapshot it. `None` means the cache already advanced.
    async fn snapshot_container(&mut self) -> Result<Option<String>> {
        if self.probe_cache().await? {
            return Ok(None);
        }
        Ok(Some(self.create_container().await?))
    }

    /// Destroy and forget tracked intermediate containers. A destroy
    /// failure is reported and the container stays tracked; cleanup never
    /// aborts a build.
    async fn clear_tmp(&mut self) {
        let containers: Vec<String> = self.tmp_containers.iter().cloned().collect();
        for id in containers {
            match self.runtime.destroy(&id).await {
                Ok(()) => {
                    self.tmp_containers.remove(&id);
                    self.output
                        .line(format!("Removing intermediate container {}", short_id(&id)));
                }
                Err(err) => {
                    tracing::warn!(container = %id, %err, "failed to remove intermediate container");
                    self.output.line(format!(
                        "Error removing intermediate container {}: {}",
                        short_id(&id),
                        err
                    ));
                }
            }
        }
    }
}

/// Parse a JSON string-array argument, falling back to `/bin/sh -c`
/// shell form.
fn exec_form(args: &str) -> Vec<String> {
    match serde_json::from_str::<Vec<String>>(args) {
        Ok(cmd) => cmd,
        Err(err) => {
            tracing::debug!(%err, "argument is not a JSON array, using shell form");
            vec!["/bin/sh".to_string(), "-c".to_string(), args.to_string()]
        }
    }
}

/// The synthetic command under which metadata-only steps are
/// fingerprinted. The `#(nop)` convention is a design constant; cache
/// compatibility depends on reproducing it byte for byte.
fn nop_cmd(comment: &str) -> Vec<String> {
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!("#(nop) {}", comment),
    ]
}
