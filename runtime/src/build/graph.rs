//! Stage graph construction.
//!
//! Splits parsed directives into `FROM`-delimited stages, assigns each stage
//! its ordinal once, validates stage names and base references, and expands
//! global `ARG`s in `FROM` lines. Dependency edges are added by the resolver.

use std::collections::HashMap;

use stagecraft_core::error::{BuildError, Result};

use super::dockerfile::{expand_vars, Directive, Dockerfile, Instruction};
use crate::oci::ImageReference;

/// Base reference meaning "start from an empty filesystem".
pub const SCRATCH: &str = "scratch";

/// Ordinal of a stage in declaration order. Assigned once at graph build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StageId(pub usize);

impl StageId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One `FROM`-delimited unit of build work.
#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    /// Declared name, normalized to lowercase
    pub name: Option<String>,
    /// Base reference after global `ARG` expansion
    pub base: String,
    /// Line of the stage's `FROM`
    pub line: usize,
    /// `FROM` text as written
    pub from_text: String,
    /// Instructions following the `FROM`, in declared order
    pub instructions: Vec<Directive>,
}

impl Stage {
    /// Name if declared, else `#<index>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }
}

/// A global `ARG` declared before the first `FROM`.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalArg {
    pub name: String,
    /// Effective value: build-arg override, else declared default
    pub value: Option<String>,
}

/// Stages in declaration order with a name index.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<Stage>,
    names: HashMap<String, StageId>,
    global_args: Vec<GlobalArg>,
}

impl StageGraph {
    /// Build the stage list from parsed directives.
    pub fn build(dockerfile: &Dockerfile, build_args: &HashMap<String, String>) -> Result<Self> {
        let mut global_args = Vec::new();
        let mut stages: Vec<Stage> = Vec::new();
        let mut names: HashMap<String, StageId> = HashMap::new();

        for directive in &dockerfile.directives {
            match &directive.instruction {
                Instruction::From { image, alias } => {
                    let id = StageId(stages.len());
                    let name = alias.as_ref().map(|a| a.to_lowercase());
                    let label = match &name {
                        Some(name) if !name.is_empty() => name.clone(),
                        _ => id.to_string(),
                    };

                    if let Some(name) = &name {
                        validate_stage_name(name, &label, directive.line)?;
                        if let Some(first) = names.get(name) {
                            return Err(BuildError::DuplicateStageName {
                                name: name.clone(),
                                first: first.index(),
                                second: id.index(),
                            });
                        }
                        names.insert(name.clone(), id);
                    }

                    let base = expand_vars(image, |key| lookup_global(&global_args, key));

                    stages.push(Stage {
                        id,
                        name,
                        base,
                        line: directive.line,
                        from_text: directive.text.clone(),
                        instructions: Vec::new(),
                    });
                }
                Instruction::Arg { name, default } if stages.is_empty() => {
                    global_args.push(GlobalArg {
                        name: name.clone(),
                        value: build_args.get(name).cloned().or_else(|| default.clone()),
                    });
                }
                _ => match stages.last_mut() {
                    Some(stage) => stage.instructions.push(directive.clone()),
                    None => {
                        return Err(BuildError::Parse {
                            line: directive.line,
                            message: format!(
                                "{} before the first FROM",
                                directive.instruction.keyword()
                            ),
                        })
                    }
                },
            }
        }

        if stages.is_empty() {
            return Err(BuildError::Parse {
                line: 1,
                message: "no FROM instruction".to_string(),
            });
        }

        let graph = Self {
            stages,
            names,
            global_args,
        };
        for stage in &graph.stages {
            graph.validate_base(stage)?;
        }

        tracing::debug!(stages = graph.stages.len(), "Built stage graph");
        Ok(graph)
    }

    /// Stages in declaration order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Look up a stage by declared name (case-insensitive).
    pub fn by_name(&self, name: &str) -> Option<StageId> {
        self.names.get(&name.to_lowercase()).copied()
    }

    pub fn global_args(&self) -> &[GlobalArg] {
        &self.global_args
    }

    /// Effective value of a global `ARG`.
    pub fn global_arg(&self, name: &str) -> Option<String> {
        lookup_global(&self.global_args, name)
    }

    /// A base is usable if it names a stage, is `scratch`, or parses as an
    /// image reference. Index-shaped tokens are left to the resolver.
    fn validate_base(&self, stage: &Stage) -> Result<()> {
        let base = stage.base.as_str();
        let malformed = |message: String| BuildError::MalformedStage {
            stage: stage.label(),
            line: stage.line,
            message,
        };

        if base.is_empty() {
            return Err(malformed(format!(
                "'{}' has an empty base image reference",
                stage.from_text
            )));
        }
        if base.eq_ignore_ascii_case(SCRATCH)
            || self.by_name(base).is_some()
            || is_index_token(base)
        {
            return Ok(());
        }
        ImageReference::parse(base)
            .map(|_| ())
            .map_err(|e| malformed(format!("invalid base image '{}': {}", base, e)))
    }
}

/// Whether a token has the shape of a stage index.
pub fn is_index_token(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit())
}

fn lookup_global(args: &[GlobalArg], key: &str) -> Option<String> {
    args.iter()
        .rev()
        .find(|a| a.name == key)
        .and_then(|a| a.value.clone())
}

/// Stage names: `[a-z][a-z0-9_.-]*` (after lowercasing).
fn validate_stage_name(name: &str, label: &str, line: usize) -> Result<()> {
    if name.is_empty() {
        return Err(BuildError::MalformedStage {
            stage: label.to_string(),
            line,
            message: "FROM ... AS requires a stage name".to_string(),
        });
    }

    let mut chars = name.chars();
    let valid = chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-'));

    if valid {
        Ok(())
    } else {
        Err(BuildError::MalformedStage {
            stage: label.to_string(),
            line,
            message: format!(
                "invalid stage name '{}': must start with a letter and contain only [a-z0-9_.-]",
                name
            ),
        })
    }
}
