//! Declarative provisioning plan.
//!
//! The packages and tools a desktop receives are data, not code. A plan is a
//! TOML file with a `[settings]` table, an optional `[retry]` table, an
//! ordered list of `[[step]]` entries and a list of `[[verify]]` entries.
//! Loading validates everything that does not depend on the target user;
//! [`Plan::steps`] then materializes concrete [`Step`]s against an
//! [`Identity`].
//!
//! ```toml
//! [[step]]
//! kind = "apt"
//! name = "apt: recon"
//! packages = ["nmap", "masscan"]
//!
//! [[verify]]
//! name = "nmap"
//! binary = "nmap"
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

use crate::executor::files::Owner;
use crate::executor::CommandSpec;
use crate::identity::Identity;
use crate::preflight::{DiskPolicy, PreflightConfig, REQUIRED_TOOLS};
use crate::retry::RetryPolicy;
use crate::step::{self, Action, Check, FailurePolicy, Step};
use crate::verify::{Probe, VerificationItem};

/// Plan used when no `--plan` is given.
const BUILTIN_PLAN: &str = include_str!("default.toml");

pub const DEFAULT_LOG_FILE: &str = "/var/log/desk-provision.log";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/desk-provision";
pub const DEFAULT_VENV_DIR: &str = "/opt/desk-provision/venv";

/// First line `dpkg-query` prints for an installed package.
const DPKG_INSTALLED: &str = "install ok installed";

/// Written into a checkout once its build commands have all succeeded.
const BUILD_STAMP: &str = ".desk-provision-built";

/// Run-wide settings from `[settings]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub log_file: PathBuf,
    pub state_dir: PathBuf,
    pub venv_dir: PathBuf,
    pub min_free_gb: u64,
    pub disk_policy: DiskPolicy,
    pub network_probe: Option<String>,
    pub network_timeout: Duration,
    pub required_tools: Vec<(String, String)>,
    pub follow_up: Vec<String>,
}

impl Settings {
    pub fn preflight(&self) -> PreflightConfig {
        PreflightConfig {
            network_probe: self.network_probe.clone(),
            network_timeout: self.network_timeout,
            disk_path: PathBuf::from("/"),
            min_free_gb: self.min_free_gb,
            disk_policy: self.disk_policy,
            required_tools: self.required_tools.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Plan {
    origin: String,
    settings: Settings,
    retry: RetryPolicy,
    steps: Vec<StepDef>,
    verify: Vec<VerifyDef>,
}

#[derive(Debug, Clone)]
struct StepDef {
    name: String,
    policy: FailurePolicy,
    retryable: bool,
    kind: StepKind,
}

#[derive(Debug, Clone)]
struct GitSource {
    repo: String,
    dest: String,
    build: Vec<String>,
}

#[derive(Debug, Clone)]
enum StepKind {
    Apt {
        packages: Vec<String>,
        update: bool,
        fallback: Option<GitSource>,
    },
    Pipx {
        packages: Vec<String>,
        pip_fallback: bool,
    },
    Venv {
        path: Option<String>,
        packages: Vec<String>,
        imports: Vec<String>,
    },
    Git {
        source: GitSource,
        creates: Option<String>,
        as_user: bool,
    },
    Snap {
        packages: Vec<String>,
        classic: bool,
    },
    Profile {
        file: Option<String>,
        marker: String,
        content: String,
    },
    File {
        path: String,
        content: String,
        mode: Option<u32>,
    },
    Command {
        program: String,
        args: Vec<String>,
        as_user: bool,
        cwd: Option<String>,
        creates: Option<String>,
        unless: Option<String>,
    },
}

#[derive(Debug, Clone)]
enum VerifyDef {
    Binary { name: String, binary: String },
    PythonModule { name: String, python: Option<String>, module: String },
    Pipx { name: String, package: String },
    Path { name: String, path: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// TOML schema
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PlanToml {
    #[serde(default)]
    settings: SettingsToml,
    #[serde(default)]
    retry: RetryToml,
    #[serde(default)]
    step: Vec<StepToml>,
    #[serde(default)]
    verify: Vec<VerifyToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    log_file: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    venv_dir: Option<PathBuf>,
    min_free_gb: Option<u64>,
    disk_policy: Option<DiskPolicy>,
    /// Empty string disables the probe.
    network_probe: Option<String>,
    network_timeout_secs: Option<u64>,
    required_tools: Option<Vec<(String, String)>>,
    follow_up: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetryToml {
    max_attempts: Option<u32>,
    initial_backoff_secs: Option<u64>,
    multiplier: Option<u32>,
    max_backoff_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FallbackToml {
    repo: String,
    dest: String,
    build: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepToml {
    kind: String,
    name: String,
    policy: Option<FailurePolicy>,
    retry: Option<bool>,
    packages: Option<Vec<String>>,
    update: Option<bool>,
    fallback: Option<FallbackToml>,
    pip_fallback: Option<bool>,
    path: Option<String>,
    imports: Option<Vec<String>>,
    repo: Option<String>,
    dest: Option<String>,
    build: Option<Vec<String>>,
    creates: Option<String>,
    as_user: Option<bool>,
    classic: Option<bool>,
    file: Option<String>,
    marker: Option<String>,
    content: Option<String>,
    mode: Option<u32>,
    program: Option<String>,
    args: Option<Vec<String>>,
    cwd: Option<String>,
    unless: Option<String>,
}

impl StepToml {
    /// Names of the kind-specific fields that are set.
    fn set_fields(&self) -> Vec<&'static str> {
        let fields = [
            ("packages", self.packages.is_some()),
            ("update", self.update.is_some()),
            ("fallback", self.fallback.is_some()),
            ("pip_fallback", self.pip_fallback.is_some()),
            ("path", self.path.is_some()),
            ("imports", self.imports.is_some()),
            ("repo", self.repo.is_some()),
            ("dest", self.dest.is_some()),
            ("build", self.build.is_some()),
            ("creates", self.creates.is_some()),
            ("as_user", self.as_user.is_some()),
            ("classic", self.classic.is_some()),
            ("file", self.file.is_some()),
            ("marker", self.marker.is_some()),
            ("content", self.content.is_some()),
            ("mode", self.mode.is_some()),
            ("program", self.program.is_some()),
            ("args", self.args.is_some()),
            ("cwd", self.cwd.is_some()),
            ("unless", self.unless.is_some()),
        ];
        fields
            .into_iter()
            .filter(|(_, set)| *set)
            .map(|(name, _)| name)
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VerifyToml {
    name: String,
    binary: Option<String>,
    python_module: Option<String>,
    python: Option<String>,
    pipx: Option<String>,
    path: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

impl Plan {
    /// The plan compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml_str(BUILTIN_PLAN, "<built-in plan>")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading plan '{}'", path.display()))?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    /// Parse and validate a plan. `origin` names the source in error messages.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self> {
        let parsed: PlanToml =
            toml::from_str(text).with_context(|| format!("parsing plan '{origin}'"))?;

        let settings = parse_settings(parsed.settings, origin)?;
        let retry = parse_retry(parsed.retry, origin)?;

        let mut seen = HashSet::new();
        let mut steps = Vec::with_capacity(parsed.step.len());
        for raw in parsed.step {
            if !seen.insert(raw.name.clone()) {
                bail!("invalid plan '{}': duplicate step name '{}'", origin, raw.name);
            }
            steps.push(parse_step(raw, origin)?);
        }

        let verify = parsed
            .verify
            .into_iter()
            .map(|raw| parse_verify(raw, origin))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            origin: origin.to_string(),
            settings,
            retry,
            steps,
            verify,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.clone()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Override the install log location.
    pub fn set_log_file(&mut self, path: PathBuf) {
        self.settings.log_file = path;
    }

    /// Materialize the steps for `identity`, in plan order.
    pub fn steps(&self, identity: &Identity) -> Result<Vec<Step>> {
        self.steps
            .iter()
            .map(|def| {
                self.materialize(def, identity).with_context(|| {
                    format!("building step '{}' from plan '{}'", def.name, self.origin)
                })
            })
            .collect()
    }

    pub fn verification_items(&self, identity: &Identity) -> Vec<VerificationItem> {
        self.verify
            .iter()
            .map(|def| match def {
                VerifyDef::Binary { name, binary } => {
                    VerificationItem::new(name, Probe::Binary(binary.clone()))
                }
                VerifyDef::PythonModule {
                    name,
                    python,
                    module,
                } => VerificationItem::new(
                    name,
                    Probe::PythonModule {
                        python: python
                            .as_deref()
                            .map(|raw| identity.expand(raw))
                            .unwrap_or_else(|| venv_python(&self.settings.venv_dir)),
                        module: module.clone(),
                    },
                ),
                VerifyDef::Pipx { name, package } => {
                    VerificationItem::new(name, Probe::PipxPackage(package.clone()))
                }
                VerifyDef::Path { name, path } => {
                    VerificationItem::new(name, Probe::Path(identity.expand(path)))
                }
            })
            .collect()
    }

    fn materialize(&self, def: &StepDef, identity: &Identity) -> Result<Step> {
        let (check, action, touches) = match &def.kind {
            StepKind::Apt {
                packages,
                update,
                fallback,
            } => {
                let install = apt_install(packages, *update);
                let installed = step::all(packages.iter().map(|package| {
                    step::output_line(
                        CommandSpec::new("dpkg-query", ["-W", "-f=${Status}\\n", package.as_str()]),
                        DPKG_INSTALLED,
                    )
                }));
                match fallback {
                    Some(source) => {
                        let dest = absolute(identity, &source.dest)?;
                        let check = step::any([installed, checkout_done(source, &dest, None)]);
                        let action =
                            step::first_success_of([install, git_clone(source, &dest, false)]);
                        (check, action, Vec::new())
                    }
                    None => (installed, install, Vec::new()),
                }
            }
            StepKind::Pipx {
                packages,
                pip_fallback,
            } => {
                let listed = CommandSpec::new("pipx", ["list", "--short"]).as_user();
                let check = step::all(packages.iter().map(|package| {
                    let in_pipx = step::output_line(listed.clone(), format!("{package} "));
                    if *pip_fallback {
                        step::any([
                            in_pipx,
                            step::succeeds(
                                CommandSpec::new("python3", ["-m", "pip", "show", package.as_str()])
                                    .as_user(),
                            ),
                        ])
                    } else {
                        in_pipx
                    }
                }));
                let action = step::sequence(packages.iter().map(|package| {
                    let pipx = step::run(CommandSpec::new("pipx", ["install", package.as_str()]).as_user());
                    if *pip_fallback {
                        step::first_success_of([
                            pipx,
                            step::run(
                                CommandSpec::new(
                                    "python3",
                                    ["-m", "pip", "install", "--user", package.as_str()],
                                )
                                .as_user(),
                            ),
                        ])
                    } else {
                        pipx
                    }
                }));
                (check, action, vec![identity.home.join(".local")])
            }
            StepKind::Venv {
                path,
                packages,
                imports,
            } => {
                let dir = match path {
                    Some(raw) => absolute(identity, raw)?,
                    None => self.settings.venv_dir.clone(),
                };
                let python = venv_python(&dir);
                let python_cmd = python.to_string_lossy().into_owned();

                let healthy = if !imports.is_empty() {
                    step::succeeds(CommandSpec::new(
                        python_cmd.clone(),
                        ["-c".to_string(), format!("import {}", imports.join(", "))],
                    ))
                } else if packages.is_empty() {
                    step::succeeds(CommandSpec::new(python_cmd.clone(), ["-c", ""]))
                } else {
                    step::succeeds(CommandSpec::new(
                        python_cmd.clone(),
                        ["-m", "pip", "show"]
                            .into_iter()
                            .map(str::to_string)
                            .chain(packages.iter().cloned()),
                    ))
                };
                let check = step::all([step::path_exists(&python), healthy]);

                let mut actions = vec![
                    step::recreate_dir(&dir, None),
                    step::run(CommandSpec::new(
                        "python3",
                        ["-m".to_string(), "venv".to_string(), dir.to_string_lossy().into_owned()],
                    )),
                    step::run(CommandSpec::new(
                        python_cmd.clone(),
                        ["-m", "pip", "install", "--upgrade", "pip"],
                    )),
                ];
                if !packages.is_empty() {
                    actions.push(step::run(CommandSpec::new(
                        python_cmd,
                        ["-m", "pip", "install"]
                            .into_iter()
                            .map(str::to_string)
                            .chain(packages.iter().cloned()),
                    )));
                }
                (check, step::sequence(actions), vec![dir])
            }
            StepKind::Git {
                source,
                creates,
                as_user,
            } => {
                let dest = absolute(identity, &source.dest)?;
                let creates = creates
                    .as_deref()
                    .map(|raw| absolute(identity, raw))
                    .transpose()?;
                let check = checkout_done(source, &dest, creates);
                let action = git_clone(source, &dest, *as_user);
                (check, action, vec![dest])
            }
            StepKind::Snap { packages, classic } => {
                let check = step::all(packages.iter().map(|package| {
                    step::succeeds(CommandSpec::new("snap", ["list", package.as_str()]))
                }));
                let action = step::sequence(packages.iter().map(|package| {
                    let mut args = vec!["install".to_string(), package.clone()];
                    if *classic {
                        args.push("--classic".to_string());
                    }
                    step::run(CommandSpec::new("snap", args))
                }));
                (check, action, Vec::new())
            }
            StepKind::Profile {
                file,
                marker,
                content,
            } => {
                let path = match file.as_deref() {
                    None | Some("auto") => profile_for(identity),
                    Some(raw) => absolute(identity, raw)?,
                };
                let check = Check::HasBlock {
                    path: path.clone(),
                    marker: marker.clone(),
                };
                let action = step::append_block(
                    &path,
                    marker.as_str(),
                    content.as_str(),
                    Some(Owner::from(identity)),
                );
                (check, action, vec![path])
            }
            StepKind::File {
                path,
                content,
                mode,
            } => {
                let path = absolute(identity, path)?;
                let owner = identity.owns(&path).then(|| Owner::from(identity));
                let check = Check::FileMatches {
                    path: path.clone(),
                    content: content.clone(),
                };
                let action = step::write_file(&path, content.as_str(), *mode, owner);
                (check, action, vec![path])
            }
            StepKind::Command {
                program,
                args,
                as_user,
                cwd,
                creates,
                unless,
            } => {
                let mut spec = CommandSpec::new(
                    fill(program, identity),
                    args.iter().map(|arg| fill(arg, identity)),
                );
                if *as_user {
                    spec = spec.as_user();
                }
                if let Some(raw) = cwd {
                    spec = spec.cwd(absolute(identity, raw)?);
                }

                let mut checks = Vec::new();
                if let Some(raw) = creates {
                    checks.push(step::path_exists(absolute(identity, raw)?));
                }
                if let Some(script) = unless {
                    let mut probe = CommandSpec::shell(fill(script, identity));
                    if *as_user {
                        probe = probe.as_user();
                    }
                    checks.push(step::succeeds(probe));
                }
                let check = match checks.len() {
                    0 => Check::Never,
                    1 => checks.remove(0),
                    _ => Check::All(checks),
                };
                (check, step::run(spec), Vec::new())
            }
        };

        let mut built = Step::new(def.name.clone(), action)
            .with_check(check)
            .with_policy(def.policy)
            .with_retry(def.retryable);
        for path in touches {
            built = built.touching(path);
        }
        Ok(built)
    }
}

fn parse_settings(raw: SettingsToml, origin: &str) -> Result<Settings> {
    let settings = Settings {
        log_file: raw.log_file.unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE)),
        state_dir: raw.state_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
        venv_dir: raw.venv_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_VENV_DIR)),
        min_free_gb: raw.min_free_gb.unwrap_or(10),
        disk_policy: raw.disk_policy.unwrap_or_default(),
        network_probe: match raw.network_probe {
            Some(probe) if probe.trim().is_empty() => None,
            Some(probe) => Some(probe.trim().to_string()),
            None => Some("deb.debian.org:80".to_string()),
        },
        network_timeout: Duration::from_secs(raw.network_timeout_secs.unwrap_or(10)),
        required_tools: raw.required_tools.unwrap_or_else(|| {
            REQUIRED_TOOLS
                .iter()
                .map(|(tool, package)| (tool.to_string(), package.to_string()))
                .collect()
        }),
        follow_up: raw.follow_up.unwrap_or_default(),
    };

    for (field, path) in [
        ("log_file", &settings.log_file),
        ("state_dir", &settings.state_dir),
        ("venv_dir", &settings.venv_dir),
    ] {
        if !path.is_absolute() {
            bail!(
                "invalid plan '{}': settings.{} must be an absolute path, got '{}'",
                origin,
                field,
                path.display()
            );
        }
    }
    Ok(settings)
}

fn parse_retry(raw: RetryToml, origin: &str) -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    let policy = RetryPolicy {
        max_attempts: raw.max_attempts.unwrap_or(defaults.max_attempts),
        initial_backoff: raw
            .initial_backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.initial_backoff),
        multiplier: raw.multiplier.unwrap_or(defaults.multiplier),
        max_backoff: raw
            .max_backoff_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.max_backoff),
    };
    if policy.max_attempts == 0 {
        bail!("invalid plan '{}': retry.max_attempts must be at least 1", origin);
    }
    if policy.multiplier < 2 {
        bail!("invalid plan '{}': retry.multiplier must be at least 2", origin);
    }
    if policy.initial_backoff > policy.max_backoff {
        bail!(
            "invalid plan '{}': retry.initial_backoff_secs exceeds retry.max_backoff_secs",
            origin
        );
    }
    Ok(policy)
}

fn parse_step(raw: StepToml, origin: &str) -> Result<StepDef> {
    let kind_name = raw.kind.trim().to_ascii_lowercase();
    let allowed: &[&str] = match kind_name.as_str() {
        "apt" => &["packages", "update", "fallback"],
        "pipx" => &["packages", "pip_fallback"],
        "venv" => &["path", "packages", "imports"],
        "git" => &["repo", "dest", "build", "creates", "as_user"],
        "snap" => &["packages", "classic"],
        "profile" => &["file", "marker", "content"],
        "file" => &["path", "content", "mode"],
        "command" => &["program", "args", "as_user", "cwd", "creates", "unless"],
        other => bail!(
            "invalid plan '{}': step '{}' has unsupported kind '{}' (expected apt, pipx, venv, git, snap, profile, file or command)",
            origin,
            raw.name,
            other
        ),
    };
    if let Some(field) = raw.set_fields().into_iter().find(|field| !allowed.contains(field)) {
        bail!(
            "invalid plan '{}': step '{}' of kind '{}' does not take '{}'",
            origin,
            raw.name,
            kind_name,
            field
        );
    }

    let name = raw.name.clone();
    let required = |value: Option<String>, field: &str| {
        value.ok_or_else(|| {
            anyhow!(
                "invalid plan '{}': step '{}' requires '{}'",
                origin,
                name,
                field
            )
        })
    };
    let packages = |value: Option<Vec<String>>| -> Result<Vec<String>> {
        let packages: Vec<String> = value
            .unwrap_or_default()
            .into_iter()
            .map(|package| package.trim().to_string())
            .filter(|package| !package.is_empty())
            .collect();
        if packages.is_empty() {
            bail!(
                "invalid plan '{}': step '{}' lists no packages",
                origin,
                name
            );
        }
        Ok(packages)
    };

    // Network-bound kinds retry by default; local file edits do not.
    let (kind, retry_default) = match kind_name.as_str() {
        "apt" => (
            StepKind::Apt {
                packages: packages(raw.packages)?,
                update: raw.update.unwrap_or(false),
                fallback: raw.fallback.map(|fallback| GitSource {
                    repo: fallback.repo,
                    dest: fallback.dest,
                    build: fallback.build.unwrap_or_default(),
                }),
            },
            true,
        ),
        "pipx" => (
            StepKind::Pipx {
                packages: packages(raw.packages)?,
                pip_fallback: raw.pip_fallback.unwrap_or(true),
            },
            true,
        ),
        "venv" => (
            StepKind::Venv {
                path: raw.path,
                packages: raw.packages.unwrap_or_default(),
                imports: raw.imports.unwrap_or_default(),
            },
            true,
        ),
        "git" => (
            StepKind::Git {
                source: GitSource {
                    repo: required(raw.repo, "repo")?,
                    dest: required(raw.dest, "dest")?,
                    build: raw.build.unwrap_or_default(),
                },
                creates: raw.creates,
                as_user: raw.as_user.unwrap_or(false),
            },
            true,
        ),
        "snap" => (
            StepKind::Snap {
                packages: packages(raw.packages)?,
                classic: raw.classic.unwrap_or(false),
            },
            true,
        ),
        "profile" => {
            let marker = required(raw.marker, "marker")?;
            if marker.trim().is_empty() || marker.contains(char::is_whitespace) {
                bail!(
                    "invalid plan '{}': step '{}' marker must be a single non-empty word",
                    origin,
                    name
                );
            }
            (
                StepKind::Profile {
                    file: raw.file,
                    marker,
                    content: required(raw.content, "content")?,
                },
                false,
            )
        }
        "file" => (
            StepKind::File {
                path: required(raw.path, "path")?,
                content: required(raw.content, "content")?,
                mode: raw.mode,
            },
            false,
        ),
        _ => (
            StepKind::Command {
                program: required(raw.program, "program")?,
                args: raw.args.unwrap_or_default(),
                as_user: raw.as_user.unwrap_or(false),
                cwd: raw.cwd,
                creates: raw.creates,
                unless: raw.unless,
            },
            false,
        ),
    };

    Ok(StepDef {
        name: raw.name,
        policy: raw.policy.unwrap_or_default(),
        retryable: raw.retry.unwrap_or(retry_default),
        kind,
    })
}

fn parse_verify(raw: VerifyToml, origin: &str) -> Result<VerifyDef> {
    let probes = [
        raw.binary.is_some(),
        raw.python_module.is_some(),
        raw.pipx.is_some(),
        raw.path.is_some(),
    ];
    if probes.iter().filter(|set| **set).count() != 1 {
        bail!(
            "invalid plan '{}': verify entry '{}' needs exactly one of binary, python_module, pipx or path",
            origin,
            raw.name
        );
    }
    if raw.python.is_some() && raw.python_module.is_none() {
        bail!(
            "invalid plan '{}': verify entry '{}' sets python without python_module",
            origin,
            raw.name
        );
    }

    let name = raw.name;
    Ok(if let Some(binary) = raw.binary {
        VerifyDef::Binary { name, binary }
    } else if let Some(module) = raw.python_module {
        VerifyDef::PythonModule {
            name,
            python: raw.python,
            module,
        }
    } else if let Some(package) = raw.pipx {
        VerifyDef::Pipx { name, package }
    } else {
        VerifyDef::Path {
            name,
            path: raw.path.unwrap_or_default(),
        }
    })
}

fn apt_install(packages: &[String], update: bool) -> Action {
    let mut actions = Vec::new();
    if update {
        actions.push(step::run(
            CommandSpec::new("apt-get", ["update"]).env("DEBIAN_FRONTEND", "noninteractive"),
        ));
    }
    actions.push(step::run(
        CommandSpec::new(
            "apt-get",
            ["install", "-y", "--no-install-recommends"]
                .into_iter()
                .map(str::to_string)
                .chain(packages.iter().cloned()),
        )
        .env("DEBIAN_FRONTEND", "noninteractive"),
    ));
    step::sequence(actions)
}

/// Satisfied once `dest` holds a checkout (or `creates`) and, when the source
/// has build commands, the build stamp.
fn checkout_done(source: &GitSource, dest: &Path, creates: Option<PathBuf>) -> Check {
    let cloned = step::path_exists(creates.unwrap_or_else(|| dest.join(".git")));
    if source.build.is_empty() {
        cloned
    } else {
        step::all([cloned, step::path_exists(dest.join(BUILD_STAMP))])
    }
}

/// Remove any partial checkout, clone shallowly, then run build commands in it.
fn git_clone(source: &GitSource, dest: &Path, as_user: bool) -> Action {
    let as_who = |spec: CommandSpec| if as_user { spec.as_user() } else { spec };
    let mut actions = vec![
        step::remove_dir(dest),
        step::run(as_who(CommandSpec::new(
            "git",
            [
                "clone".to_string(),
                "--depth".to_string(),
                "1".to_string(),
                source.repo.clone(),
                dest.to_string_lossy().into_owned(),
            ],
        ))),
    ];
    actions.extend(
        source
            .build
            .iter()
            .map(|command| step::run(as_who(CommandSpec::shell(command.as_str()).cwd(dest)))),
    );
    if !source.build.is_empty() {
        actions.push(step::write_file(dest.join(BUILD_STAMP), "", None, None));
    }
    step::sequence(actions)
}

fn venv_python(dir: &Path) -> PathBuf {
    dir.join("bin/python")
}

/// `~/.zshrc` for zsh users, `~/.bashrc` otherwise.
fn profile_for(identity: &Identity) -> PathBuf {
    match identity.shell_name() {
        "zsh" => identity.home.join(".zshrc"),
        _ => identity.home.join(".bashrc"),
    }
}

fn absolute(identity: &Identity, raw: &str) -> Result<PathBuf> {
    let path = identity.expand(raw.trim());
    if !path.is_absolute() {
        bail!("path '{}' must be absolute or start with '~/'", raw);
    }
    Ok(path)
}

/// Substitute `{user}` and `{home}` in command arguments.
fn fill(raw: &str, identity: &Identity) -> String {
    raw.replace("{user}", &identity.username)
        .replace("{home}", &identity.home.to_string_lossy())
}
