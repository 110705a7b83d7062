use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use loft_domain::{ArchiveId, Environment, Template, WorkspaceArchive};
use loft_store::Repository;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::driver::{Driver, ProvisionContext, ProvisionOutcome};
use crate::error::DriverError;
use crate::providers::ProviderHooks;

/// Keep only this much of the tool's combined output in error reasons.
const OUTPUT_TAIL_BYTES: usize = 64 * 1024;

// ── Tool subprocess runner ────────────────────────────────────────────────────

/// Invokes the external IaaS tool (`init`/`plan`/`apply`/`destroy`/`output`)
/// inside a per-environment workspace directory.
///
/// Subprocess contract: `TF_IN_AUTOMATION=true` and `TF_CLI_ARGS=-no-color`
/// are always set, stdout and stderr are merged in arrival order, and a hard
/// wall-clock timeout kills the process.
#[derive(Clone)]
pub struct IaasToolRunner {
    pub binary: String,
    /// Parent of all workspace directories.
    pub scratch_dir: PathBuf,
    /// Hard cap per tool invocation.
    pub step_timeout: Duration,
}

impl IaasToolRunner {
    pub fn new(binary: impl Into<String>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            scratch_dir: scratch_dir.into(),
            step_timeout: Duration::from_secs(1800),
        }
    }

    pub fn workspace_dir(&self, env: &Environment) -> PathBuf {
        self.scratch_dir.join(env.id.to_string())
    }

    /// Write a fresh workspace for the environment: the rendered template as
    /// `main.tf`, the template's variables file, and a generated
    /// `loft_context.auto.tfvars` carrying the well-known placeholders.
    pub async fn render_workspace(
        &self,
        env: &Environment,
        template: &Template,
        default_vars: &HashMap<String, String>,
    ) -> Result<PathBuf, DriverError> {
        let workspace = self.workspace_dir(env);
        if workspace.exists() {
            tokio::fs::remove_dir_all(&workspace)
                .await
                .map_err(|e| DriverError::Internal(format!("clear workspace: {e}")))?;
        }
        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| DriverError::Internal(format!("create workspace dir: {e}")))?;

        let iaas_text = template
            .iaas_template
            .as_deref()
            .ok_or_else(|| DriverError::Internal("cloud template without IaaS text".into()))?;
        let rendered = render_placeholders(iaas_text, env);
        tokio::fs::write(workspace.join("main.tf"), rendered)
            .await
            .map_err(|e| DriverError::Internal(format!("write main.tf: {e}")))?;

        if let Some(vars) = &template.iaas_variables {
            tokio::fs::write(workspace.join("terraform.tfvars"), vars)
                .await
                .map_err(|e| DriverError::Internal(format!("write terraform.tfvars: {e}")))?;
        }

        let context = context_tfvars(env, default_vars);
        tokio::fs::write(workspace.join("loft_context.auto.tfvars"), context)
            .await
            .map_err(|e| DriverError::Internal(format!("write context tfvars: {e}")))?;

        Ok(workspace)
    }

    pub async fn init(
        &self,
        workspace: &Path,
        auth_env: &HashMap<String, String>,
    ) -> Result<(), DriverError> {
        self.run_checked("init", workspace, &["init", "-input=false"], auth_env)
            .await
            .map(|_| ())
    }

    pub async fn plan(
        &self,
        workspace: &Path,
        vars: &BTreeMap<String, String>,
        auth_env: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        let mut args: Vec<String> = vec!["plan".into(), "-input=false".into(), "-out=plan".into()];
        for (key, value) in vars {
            args.push("-var".into());
            args.push(format!("{key}={value}"));
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked("plan", workspace, &refs, auth_env).await
    }

    pub async fn apply(
        &self,
        workspace: &Path,
        auth_env: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        self.run_checked("apply", workspace, &["apply", "-input=false", "plan"], auth_env)
            .await
    }

    pub async fn destroy(
        &self,
        workspace: &Path,
        vars: &BTreeMap<String, String>,
        auth_env: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        let mut args: Vec<String> =
            vec!["destroy".into(), "-input=false".into(), "-auto-approve".into()];
        for (key, value) in vars {
            args.push("-var".into());
            args.push(format!("{key}={value}"));
        }
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked("destroy", workspace, &refs, auth_env).await
    }

    /// `output -json`, flattened to key → string.
    pub async fn outputs(
        &self,
        workspace: &Path,
        auth_env: &HashMap<String, String>,
    ) -> Result<BTreeMap<String, String>, DriverError> {
        let log = self
            .run_checked("output", workspace, &["output", "-json"], auth_env)
            .await?;
        parse_outputs(&log)
    }

    async fn run_checked(
        &self,
        step: &str,
        workspace: &Path,
        args: &[&str],
        auth_env: &HashMap<String, String>,
    ) -> Result<String, DriverError> {
        let (code, log) = self.run(step, workspace, args, auth_env).await?;
        if code != 0 {
            return Err(DriverError::IaasTool {
                step: step.to_string(),
                tail: output_tail(&log),
            });
        }
        Ok(log)
    }

    /// Run one tool sub-command, returning (exit code, combined output).
    async fn run(
        &self,
        step: &str,
        workspace: &Path,
        args: &[&str],
        auth_env: &HashMap<String, String>,
    ) -> Result<(i32, String), DriverError> {
        info!(binary = %self.binary, ?args, workspace = %workspace.display(), "running IaaS command");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(workspace)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .env("TF_IN_AUTOMATION", "true")
            .env("TF_CLI_ARGS", "-no-color")
            .env("TF_INPUT", "0")
            .envs(auth_env)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| DriverError::Internal(format!("spawn {}: {e}", self.binary)))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");

        // Merge stdout and stderr by reading them concurrently into a shared
        // buffer; each line is mirrored to tracing.
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        let tx1 = tx.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx1.send(line);
            }
        });

        let tx2 = tx.clone();
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let _ = tx2.send(line);
            }
        });

        drop(tx); // rx finishes once both reader tasks finish

        let mut log = String::new();
        let collect = async {
            while let Some(line) = rx.recv().await {
                debug!(target: "loft::iaas", "{}", line);
                log.push_str(&line);
                log.push('\n');
            }
        };
        let timed_out = tokio::time::timeout(self.step_timeout, collect).await.is_err();

        stdout_task.await.ok();
        stderr_task.await.ok();

        if timed_out {
            let _ = child.kill().await;
            return Err(DriverError::Timeout {
                step: step.to_string(),
                seconds: self.step_timeout.as_secs(),
            });
        }

        let status = child
            .wait()
            .await
            .map_err(|e| DriverError::Internal(format!("wait {}: {e}", self.binary)))?;

        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(binary = %self.binary, step, code, "IaaS command exited non-zero");
        }
        Ok((code, log))
    }
}

// ── Rendering helpers ─────────────────────────────────────────────────────────

/// Substitute the well-known `{{placeholder}}` markers into the template.
fn render_placeholders(text: &str, env: &Environment) -> String {
    text.replace("{{environment_id}}", &env.id.to_string())
        .replace("{{environment_name}}", &env.name)
        .replace("{{owner_id}}", env.owner.as_str())
}

/// One HCL string variable assignment, escaped.
fn tfvar(key: &str, value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{key} = \"{escaped}\"\n")
}

/// Generate `loft_context.auto.tfvars`: the environment's identity tags plus
/// the provider's default variables, keys sorted.
fn context_tfvars(env: &Environment, default_vars: &HashMap<String, String>) -> String {
    let mut content = String::from("# Generated by loft — do not edit\n\n");
    content.push_str(&tfvar("loft_environment_id", &env.id.to_string()));
    content.push_str(&tfvar("loft_environment_name", &env.name));
    content.push_str(&tfvar("loft_owner_id", env.owner.as_str()));
    if !default_vars.is_empty() {
        content.push('\n');
        let mut keys: Vec<&String> = default_vars.keys().collect();
        keys.sort();
        for k in keys {
            content.push_str(&tfvar(k, &default_vars[k]));
        }
    }
    content
}

fn parse_outputs(json_text: &str) -> Result<BTreeMap<String, String>, DriverError> {
    let map: serde_json::Value = serde_json::from_str(json_text.trim())
        .map_err(|e| DriverError::Internal(format!("parse tool outputs: {e}")))?;
    let object = map
        .as_object()
        .ok_or_else(|| DriverError::Internal("tool outputs not an object".into()))?;

    let mut outputs = BTreeMap::new();
    for (key, entry) in object {
        let value = entry.get("value").unwrap_or(entry);
        let as_string = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        outputs.insert(key.clone(), as_string);
    }
    Ok(outputs)
}

/// Last 64 KiB of the tool's output, on a char boundary.
fn output_tail(log: &str) -> String {
    if log.len() <= OUTPUT_TAIL_BYTES {
        return log.to_string();
    }
    let mut start = log.len() - OUTPUT_TAIL_BYTES;
    while !log.is_char_boundary(start) {
        start += 1;
    }
    log[start..].to_string()
}

// ── Workspace archives ────────────────────────────────────────────────────────

/// Zip every file in the workspace except the tool's provider cache.
pub fn zip_workspace(workspace: &Path) -> Result<(Vec<u8>, String), DriverError> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buffer);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        add_dir_entries(&mut zip, workspace, workspace, options)?;
        zip.finish()
            .map_err(|e| DriverError::Internal(format!("finish archive: {e}")))?;
    }
    let bytes = buffer.into_inner();
    let checksum = format!("{:x}", Sha256::digest(&bytes));
    Ok((bytes, checksum))
}

fn add_dir_entries(
    zip: &mut zip::ZipWriter<&mut std::io::Cursor<Vec<u8>>>,
    root: &Path,
    dir: &Path,
    options: zip::write::SimpleFileOptions,
) -> Result<(), DriverError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| DriverError::Internal(format!("read workspace dir: {e}")))?;
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        // provider binaries are re-fetched by init on restore
        if name == ".terraform" {
            continue;
        }
        if path.is_dir() {
            add_dir_entries(zip, root, &path, options)?;
            continue;
        }
        let relative = path
            .strip_prefix(root)
            .map_err(|e| DriverError::Internal(format!("archive path: {e}")))?
            .to_string_lossy()
            .into_owned();
        zip.start_file(relative, options)
            .map_err(|e| DriverError::Internal(format!("archive entry: {e}")))?;
        let bytes = std::fs::read(&path)
            .map_err(|e| DriverError::Internal(format!("read {}: {e}", path.display())))?;
        zip.write_all(&bytes)
            .map_err(|e| DriverError::Internal(format!("write archive entry: {e}")))?;
    }
    Ok(())
}

/// Extract an archive into `dest`, verifying its checksum first.
pub fn restore_workspace(
    dest: &Path,
    bytes: &[u8],
    expected_checksum: &str,
) -> Result<(), DriverError> {
    let actual = format!("{:x}", Sha256::digest(bytes));
    if actual != expected_checksum {
        return Err(DriverError::ArchiveCorrupt {
            expected: expected_checksum.to_string(),
            actual,
        });
    }

    if dest.exists() {
        std::fs::remove_dir_all(dest)
            .map_err(|e| DriverError::Internal(format!("clear restore dir: {e}")))?;
    }
    std::fs::create_dir_all(dest)
        .map_err(|e| DriverError::Internal(format!("create restore dir: {e}")))?;

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| DriverError::Internal(format!("open archive: {e}")))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| DriverError::Internal(format!("archive entry {i}: {e}")))?;
        let Some(relative) = file.enclosed_name() else {
            return Err(DriverError::Internal(format!(
                "archive entry {i} has an unsafe path"
            )));
        };
        let out_path = dest.join(relative);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DriverError::Internal(format!("create {}: {e}", parent.display())))?;
        }
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| DriverError::Internal(format!("read archive entry: {e}")))?;
        std::fs::write(&out_path, contents)
            .map_err(|e| DriverError::Internal(format!("write {}: {e}", out_path.display())))?;
    }
    Ok(())
}

// ── Cloud driver ──────────────────────────────────────────────────────────────

/// Drives cloud-backed environments through the IaaS tool, bracketed by the
/// provider's hooks. Workspace state survives between operations as an
/// archive blob in the repository.
pub struct CloudDriver {
    runner: IaasToolRunner,
    hooks: Arc<dyn ProviderHooks>,
    repo: Arc<dyn Repository>,
}

impl CloudDriver {
    pub fn new(
        runner: IaasToolRunner,
        hooks: Arc<dyn ProviderHooks>,
        repo: Arc<dyn Repository>,
    ) -> Self {
        Self { runner, hooks, repo }
    }

    /// Archive the workspace and persist it, returning the new archive id.
    async fn persist_archive(
        &self,
        env: &Environment,
        workspace: &Path,
    ) -> Result<ArchiveId, DriverError> {
        let (bytes, checksum) = zip_workspace(workspace)?;
        let meta = WorkspaceArchive {
            id: ArchiveId::random(),
            environment_id: env.id,
            checksum,
            created_at: Utc::now(),
        };
        self.repo
            .put_archive(&meta, &bytes)
            .await
            .map_err(|e| DriverError::Internal(format!("persist archive: {e}")))?;
        Ok(meta.id)
    }

    /// Extract the environment's archive into a fresh workspace and re-init.
    async fn restore_and_init(&self, env: &Environment) -> Result<Option<PathBuf>, DriverError> {
        let Some(archive_id) = env.archive_id else {
            return Ok(None);
        };
        let Some((meta, bytes)) = self
            .repo
            .get_archive(&archive_id)
            .await
            .map_err(|e| DriverError::Internal(format!("load archive: {e}")))?
        else {
            return Ok(None);
        };

        let workspace = self.runner.workspace_dir(env);
        restore_workspace(&workspace, &bytes, &meta.checksum)?;
        self.runner.init(&workspace, &self.hooks.auth_env()).await?;
        Ok(Some(workspace))
    }

    /// Re-apply the workspace with the provider's lifecycle variable set to
    /// `state`, flipping the stoppable resources the template declares.
    async fn apply_lifecycle_state(
        &self,
        env: &Environment,
        state: &str,
    ) -> Result<(), DriverError> {
        let Some(workspace) = self.restore_and_init(env).await? else {
            debug!(environment_id = %env.id, "no archive; nothing to re-apply");
            return Ok(());
        };
        let auth_env = self.hooks.auth_env();
        let mut vars = BTreeMap::new();
        vars.insert("loft_environment_state".to_string(), state.to_string());
        self.runner.plan(&workspace, &vars, &auth_env).await?;
        self.runner.apply(&workspace, &auth_env).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for CloudDriver {
    fn name(&self) -> &'static str {
        "iaas"
    }

    async fn provision(&self, ctx: &ProvisionContext) -> Result<ProvisionOutcome, DriverError> {
        let env = &ctx.environment;
        let template = &ctx.template;

        let iaas_text = template.iaas_template.as_deref().unwrap_or_default();
        if !self.hooks.validate_template(iaas_text) {
            return Err(DriverError::TemplateRejected {
                kind: self.hooks.kind(),
                reason: "provider validation failed".into(),
            });
        }

        self.hooks.pre_provision(env).await.map_err(|e| DriverError::HookFailed {
            hook: "pre_provision".into(),
            reason: e.to_string(),
        })?;

        let mut default_vars = self.hooks.default_variables();
        if let Some(region) = &template.region {
            default_vars
                .entry("loft_region".to_string())
                .or_insert_with(|| region.clone());
        }

        let workspace = self.runner.render_workspace(env, template, &default_vars).await?;
        let auth_env = self.hooks.auth_env();

        self.runner.init(&workspace, &auth_env).await?;
        self.runner.plan(&workspace, &BTreeMap::new(), &auth_env).await?;
        self.runner.apply(&workspace, &auth_env).await?;
        let resources = self.runner.outputs(&workspace, &auth_env).await?;

        let archive_id = self.persist_archive(env, &workspace).await?;

        // Infrastructure exists; a post-hook failure is logged, never rolled back.
        if let Err(e) = self.hooks.post_provision(env).await {
            warn!(environment_id = %env.id, error = %e, "post_provision hook failed");
        }

        Ok(ProvisionOutcome {
            containers: vec![],
            resources,
            archive_id: Some(archive_id),
        })
    }

    async fn start(&self, env: &Environment) -> Result<(), DriverError> {
        self.hooks.start_resources(env).await.map_err(|e| DriverError::HookFailed {
            hook: "start_resources".into(),
            reason: e.to_string(),
        })?;
        self.apply_lifecycle_state(env, "running").await
    }

    async fn stop(&self, env: &Environment, _grace: Duration) -> Result<(), DriverError> {
        self.hooks.stop_resources(env).await.map_err(|e| DriverError::HookFailed {
            hook: "stop_resources".into(),
            reason: e.to_string(),
        })?;
        self.apply_lifecycle_state(env, "stopped").await
    }

    async fn teardown(&self, env: &Environment) -> Result<(), DriverError> {
        self.hooks.pre_destroy(env).await.map_err(|e| DriverError::HookFailed {
            hook: "pre_destroy".into(),
            reason: e.to_string(),
        })?;

        match self.restore_and_init(env).await? {
            Some(workspace) => {
                let auth_env = self.hooks.auth_env();
                self.runner.destroy(&workspace, &BTreeMap::new(), &auth_env).await?;
            }
            None => {
                debug!(environment_id = %env.id, "no workspace archive; nothing to destroy");
            }
        }

        // The destroy succeeded; only now is the archive disposable.
        if let Some(archive_id) = env.archive_id {
            if let Err(e) = self.repo.delete_archive(&archive_id).await {
                warn!(environment_id = %env.id, error = %e, "archive delete failed");
            }
        }

        if let Err(e) = self.hooks.post_destroy(env).await {
            warn!(environment_id = %env.id, error = %e, "post_destroy hook failed");
        }
        Ok(())
    }
}
