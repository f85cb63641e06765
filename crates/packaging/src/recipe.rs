//! Dockerfile rendering for each build stage.

use lambda_build_models::{BuildError, Config, EntrypointDescriptor, PackageManager, Stage, ENTRYPOINT_LABEL};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;

use crate::manifest::DependencyManifest;
use crate::rewrite::PublicPrefix;
use crate::source::{ContextFile, SourceBundle};

/// Build-context directory holding the function source.
pub const SOURCE_CONTEXT_DIR: &str = "src";

/// Build-context path of the dependency manifest.
pub const MANIFEST_CONTEXT_PATH: &str = "requirements.txt";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Run { script: String, secret: Option<String> },
    Copy { src: String, dest: String },
    WorkDir(String),
    Label { key: String, value: String },
    Cmd(Vec<String>),
}

impl Instruction {
    pub fn run(script: impl Into<String>) -> Self {
        Instruction::Run {
            script: script.into(),
            secret: None,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Instruction::Run { script, secret: None } => format!("RUN {script}"),
            Instruction::Run {
                script,
                secret: Some(id),
            } => format!("RUN --mount=type=secret,id={id},required=true {script}"),
            Instruction::Copy { src, dest } => format!("COPY {src} {dest}"),
            Instruction::WorkDir(dir) => format!("WORKDIR {dir}"),
            Instruction::Label { key, value } => format!("LABEL {key}={}", json_string(value)),
            Instruction::Cmd(args) => {
                let args: Vec<String> = args.iter().map(|a| json_string(a)).collect();
                format!("CMD [{}]", args.join(", "))
            }
        }
    }
}

fn json_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// One layer-committing stage: the instructions that follow `FROM <parent>`
/// and the files its build context needs.
#[derive(Debug, Clone)]
pub struct RecipeStep {
    pub stage: Stage,
    pub instructions: Vec<Instruction>,
    pub context: Vec<ContextFile>,
}

impl RecipeStep {
    fn new(stage: Stage, instructions: Vec<Instruction>) -> Self {
        Self {
            stage,
            instructions,
            context: Vec::new(),
        }
    }

    /// Secret id mounted by any `RUN` in this step.
    pub fn secret_id(&self) -> Option<&str> {
        self.instructions.iter().find_map(|i| match i {
            Instruction::Run { secret: Some(id), .. } => Some(id.as_str()),
            _ => None,
        })
    }

    pub fn dockerfile(&self, parent: &str) -> String {
        let mut out = format!("FROM {parent}\n");
        for instruction in &self.instructions {
            out.push_str(&instruction.render());
            out.push('\n');
        }
        out
    }
}

/// Where the rewrite rule gets into the install step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteMount {
    pub prefix: PublicPrefix,
    pub secret_id: String,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    base_image: String,
    rewrite: Option<RewriteMount>,
    manifest: DependencyManifest,
    entrypoint: EntrypointDescriptor,
    steps: Vec<RecipeStep>,
}

impl Recipe {
    pub fn from_config(
        config: &Config,
        manifest: DependencyManifest,
        source: Option<&SourceBundle>,
    ) -> Result<Self, BuildError> {
        let task_root = config.base.task_root.trim_end_matches('/').to_string();
        let rewrite = if config.vcs.auth {
            Some(RewriteMount {
                prefix: PublicPrefix::parse(&config.vcs.public_prefix)?,
                secret_id: config.vcs.secret_id.clone(),
            })
        } else {
            None
        };
        let entrypoint = EntrypointDescriptor::new(config.entrypoint.handler.trim());

        let pm = config.system.package_manager;
        let mut steps = Vec::new();
        if config.system.upgrade {
            steps.push(RecipeStep::new(
                Stage::SystemUpdate,
                vec![Instruction::run(upgrade_script(pm))],
            ));
        }
        steps.push(RecipeStep::new(
            Stage::VcsClient,
            vec![Instruction::run(install_script(pm, &config.vcs.client_package))],
        ));
        steps.push(install_step(
            &task_root,
            &manifest,
            rewrite.as_ref(),
            &config.dependencies.installer,
            &config.dependencies.extra_args,
        ));

        if let Some(source) = source.filter(|s| !s.files.is_empty()) {
            let mut step = RecipeStep::new(
                Stage::SourceCopy,
                vec![Instruction::Copy {
                    src: format!("{SOURCE_CONTEXT_DIR}/"),
                    dest: format!("{task_root}/"),
                }],
            );
            step.context = source.context_files(SOURCE_CONTEXT_DIR);
            steps.push(step);
        }

        steps.push(RecipeStep::new(
            Stage::Entrypoint,
            vec![
                Instruction::WorkDir(task_root),
                Instruction::Label {
                    key: ENTRYPOINT_LABEL.to_string(),
                    value: entrypoint.as_str().to_string(),
                },
                Instruction::Cmd(entrypoint.cmd()),
            ],
        ));

        Ok(Self {
            base_image: config.base.image.trim().to_string(),
            rewrite,
            manifest,
            entrypoint,
            steps,
        })
    }

    pub fn base_image(&self) -> &str {
        &self.base_image
    }

    pub fn rewrite(&self) -> Option<&RewriteMount> {
        self.rewrite.as_ref()
    }

    pub fn manifest(&self) -> &DependencyManifest {
        &self.manifest
    }

    pub fn entrypoint(&self) -> &EntrypointDescriptor {
        &self.entrypoint
    }

    pub fn steps(&self) -> &[RecipeStep] {
        &self.steps
    }

    /// Every stage the build passes through, including the ones that commit
    /// no layer.
    pub fn stages(&self) -> Vec<Stage> {
        let mut stages = vec![Stage::BaseImage];
        for step in &self.steps {
            if step.stage == Stage::DependencyInstall && self.rewrite.is_some() {
                stages.push(Stage::CredentialRewrite);
            }
            stages.push(step.stage);
        }
        stages
    }

    /// Whether the base reference names an immutable digest.
    pub fn base_is_pinned(&self) -> bool {
        self.base_image.contains("@sha256:")
    }

    /// The whole build as one Dockerfile, for review. Carries the secret
    /// mount but never a secret value.
    pub fn render_dockerfile(&self) -> String {
        let mut out = format!("FROM {}\n", self.base_image);
        for step in &self.steps {
            if step.stage == Stage::DependencyInstall {
                if let Some(rewrite) = &self.rewrite {
                    let _ = writeln!(
                        out,
                        "\n# {}: {} via secret '{}'",
                        Stage::CredentialRewrite,
                        rewrite.prefix,
                        rewrite.secret_id
                    );
                }
            }
            let _ = writeln!(out, "\n# {}", step.stage);
            for instruction in &step.instructions {
                out.push_str(&instruction.render());
                out.push('\n');
            }
        }
        out
    }

    /// Cache key over the rendered recipe and every context file.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.render_dockerfile().as_bytes());
        for step in &self.steps {
            hasher.update(step.stage.as_str().as_bytes());
            for file in &step.context {
                hasher.update(file.path.as_bytes());
                hasher.update([0u8]);
                hasher.update(file.mode.to_le_bytes());
                hasher.update(Sha256::digest(&file.data));
            }
        }
        format!("{:x}", hasher.finalize())
    }
}

fn upgrade_script(pm: PackageManager) -> String {
    match pm {
        PackageManager::Dnf => "dnf -y upgrade && dnf clean all".to_string(),
        PackageManager::Yum => "yum -y update && yum clean all".to_string(),
        PackageManager::Apt => "apt-get update \
            && DEBIAN_FRONTEND=noninteractive apt-get -y upgrade \
            && rm -rf /var/lib/apt/lists/*"
            .to_string(),
        PackageManager::Apk => "apk upgrade --no-cache".to_string(),
    }
}

fn install_script(pm: PackageManager, package: &str) -> String {
    match pm {
        PackageManager::Dnf => format!("dnf -y install {package} && dnf clean all"),
        PackageManager::Yum => format!("yum -y install {package} && yum clean all"),
        PackageManager::Apt => format!(
            "apt-get update \
             && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends {package} \
             && rm -rf /var/lib/apt/lists/*"
        ),
        PackageManager::Apk => format!("apk add --no-cache {package}"),
    }
}

fn install_step(
    task_root: &str,
    manifest: &DependencyManifest,
    rewrite: Option<&RewriteMount>,
    installer: &str,
    extra_args: &[String],
) -> RecipeStep {
    let manifest_path = format!("{task_root}/{MANIFEST_CONTEXT_PATH}");
    let mut instructions = vec![Instruction::Copy {
        src: MANIFEST_CONTEXT_PATH.to_string(),
        dest: manifest_path.clone(),
    }];

    if !manifest.is_empty() {
        let mut install = format!("{installer} install");
        for arg in extra_args {
            install.push(' ');
            install.push_str(arg);
        }
        let _ = write!(install, " -r {manifest_path} --target \"{task_root}\"");

        instructions.push(match rewrite {
            Some(rewrite) => Instruction::Run {
                script: format!(
                    "set -eu; {}; export GIT_TERMINAL_PROMPT=0; {install}",
                    rewrite.prefix.shell_prelude(&rewrite.secret_id)
                ),
                secret: Some(rewrite.secret_id.clone()),
            },
            None => Instruction::run(install),
        });
    }

    let mut step = RecipeStep::new(Stage::DependencyInstall, instructions);
    step.context = vec![ContextFile::new(MANIFEST_CONTEXT_PATH, manifest.render())];
    step
}
