//! Stage reference resolution.
//!
//! Binds every `COPY --from` token and every `FROM` base to either a stage in
//! the graph or an external image. Precedence: declared name, then in-range
//! index, then external image. Internal bindings become dependency edges; the
//! resulting graph must be acyclic and only point at earlier stages.

use std::collections::{BTreeSet, HashMap, HashSet};

use stagecraft_core::error::{BuildError, Result};

use super::dockerfile::{expand_vars, Instruction};
use super::graph::{is_index_token, GlobalArg, StageGraph, StageId, SCRATCH};
use crate::oci::ImageReference;

/// Result of resolving a stage reference token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Stage(StageId),
    Image(ImageReference),
}

/// Where a stage's initial filesystem comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    Stage(StageId),
    Image(ImageReference),
    Scratch,
}

/// Where a `COPY` reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySource {
    /// The build context supplied by the invoker
    Context,
    Stage(StageId),
    Image(ImageReference),
}

/// A `COPY` with its source resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyStep {
    pub source: CopySource,
    pub src: Vec<String>,
    pub dst: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Copy(CopyStep),
    /// Any other stage-local instruction, executed as declared
    Exec(Instruction),
}

/// One instruction of a resolved stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub line: usize,
    pub text: String,
    pub action: Action,
}

#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub id: StageId,
    pub name: Option<String>,
    pub line: usize,
    pub from_text: String,
    pub base: BaseSource,
    pub steps: Vec<Step>,
}

impl ResolvedStage {
    /// Name if declared, else `#<index>`.
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.id.to_string(),
        }
    }

    /// Base stage, if this stage starts from another stage.
    pub fn base_stage(&self) -> Option<StageId> {
        match self.base {
            BaseSource::Stage(id) => Some(id),
            _ => None,
        }
    }
}

/// An internal dependency and the instruction that induced it.
#[derive(Debug, Clone)]
struct Edge {
    from: StageId,
    to: StageId,
    instruction: String,
}

/// Stages plus dependency edges induced by copies and stage bases.
#[derive(Debug, Clone)]
pub struct BuildGraph {
    stages: Vec<ResolvedStage>,
    names: HashMap<String, StageId>,
    deps: Vec<BTreeSet<StageId>>,
    external: Vec<Vec<ImageReference>>,
    global_args: Vec<GlobalArg>,
}

/// Resolve a token against the declared stages.
///
/// Only an index-shaped token that is out of range fails; every other
/// unmatched token is an external image reference.
pub fn resolve_token(
    graph: &StageGraph,
    consumer: &str,
    instruction: &str,
    token: &str,
) -> Result<Source> {
    if let Some(id) = graph.by_name(token) {
        return Ok(Source::Stage(id));
    }

    if is_index_token(token) {
        return match token.parse::<usize>() {
            Ok(index) if index < graph.len() => Ok(Source::Stage(StageId(index))),
            _ => Err(BuildError::UnresolvedInternalReference {
                stage: consumer.to_string(),
                instruction: instruction.to_string(),
                token: token.to_string(),
                stage_count: graph.len(),
            }),
        };
    }

    ImageReference::parse(token)
        .map(Source::Image)
        .map_err(|e| BuildError::InvalidStageReference {
            stage: consumer.to_string(),
            instruction: instruction.to_string(),
            token: token.to_string(),
            message: match e {
                BuildError::InvalidReference(message) => message,
                other => other.to_string(),
            },
        })
}

impl BuildGraph {
    /// Resolve all references in `graph` and validate the dependency edges.
    pub fn resolve(graph: StageGraph) -> Result<Self> {
        let count = graph.len();
        let mut stages = Vec::with_capacity(count);
        let mut edges = Vec::new();
        let mut external = vec![Vec::new(); count];
        let mut names = HashMap::new();

        for stage in graph.stages() {
            let label = stage.label();
            if let Some(name) = &stage.name {
                names.insert(name.clone(), stage.id);
            }

            let base = if stage.base.eq_ignore_ascii_case(SCRATCH) {
                BaseSource::Scratch
            } else {
                match resolve_token(&graph, &label, &stage.from_text, &stage.base)? {
                    Source::Stage(target) => {
                        edges.push(Edge {
                            from: stage.id,
                            to: target,
                            instruction: stage.from_text.clone(),
                        });
                        BaseSource::Stage(target)
                    }
                    Source::Image(reference) => {
                        external[stage.id.index()].push(reference.clone());
                        BaseSource::Image(reference)
                    }
                }
            };

            let mut steps = Vec::with_capacity(stage.instructions.len());
            for directive in &stage.instructions {
                let action = match &directive.instruction {
                    Instruction::Copy { src, dst, from } => {
                        let source = match from {
                            None => CopySource::Context,
                            Some(token) => {
                                let token = expand_vars(token, |k| graph.global_arg(k));
                                match resolve_token(&graph, &label, &directive.text, &token)? {
                                    Source::Stage(target) => {
                                        edges.push(Edge {
                                            from: stage.id,
                                            to: target,
                                            instruction: directive.text.clone(),
                                        });
                                        CopySource::Stage(target)
                                    }
                                    Source::Image(reference) => {
                                        external[stage.id.index()].push(reference.clone());
                                        CopySource::Image(reference)
                                    }
                                }
                            }
                        };
                        Action::Copy(CopyStep {
                            source,
                            src: src.clone(),
                            dst: dst.clone(),
                        })
                    }
                    other => Action::Exec(other.clone()),
                };
                steps.push(Step {
                    line: directive.line,
                    text: directive.text.clone(),
                    action,
                });
            }

            stages.push(ResolvedStage {
                id: stage.id,
                name: stage.name.clone(),
                line: stage.line,
                from_text: stage.from_text.clone(),
                base,
                steps,
            });
        }

        let mut deps = vec![BTreeSet::new(); count];
        for edge in &edges {
            deps[edge.from.index()].insert(edge.to);
        }
        for refs in &mut external {
            let mut seen = HashSet::new();
            refs.retain(|r| seen.insert(r.clone()));
        }

        let resolved = Self {
            stages,
            names,
            deps,
            external,
            global_args: graph.global_args().to_vec(),
        };
        resolved.validate_edges(&edges)?;

        tracing::debug!(
            stages = count,
            edges = edges.len(),
            "Resolved stage references"
        );
        Ok(resolved)
    }

    /// Self-references and cycles first, then any remaining forward edge.
    fn validate_edges(&self, edges: &[Edge]) -> Result<()> {
        if let Some(edge) = edges.iter().find(|e| e.from == e.to) {
            let label = self.label(edge.from);
            return Err(BuildError::CyclicDependency {
                stage: label.clone(),
                instruction: edge.instruction.clone(),
                cycle: vec![label.clone(), label],
            });
        }

        if let Some(cycle) = self.find_cycle() {
            let (from, to) = (cycle[0], cycle[1]);
            let instruction = edges
                .iter()
                .find(|e| e.from == from && e.to == to)
                .map(|e| e.instruction.clone())
                .unwrap_or_default();
            return Err(BuildError::CyclicDependency {
                stage: self.label(from),
                instruction,
                cycle: cycle.iter().map(|id| self.label(*id)).collect(),
            });
        }

        if let Some(edge) = edges.iter().find(|e| e.to > e.from) {
            return Err(BuildError::ForwardReference {
                stage: self.label(edge.from),
                instruction: edge.instruction.clone(),
                target: self.label(edge.to),
            });
        }

        Ok(())
    }

    /// Returns a closed path `[a, b, ..., a]` if the edges contain a cycle.
    fn find_cycle(&self) -> Option<Vec<StageId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            graph: &BuildGraph,
            id: StageId,
            marks: &mut [Mark],
            path: &mut Vec<StageId>,
        ) -> Option<Vec<StageId>> {
            marks[id.index()] = Mark::Active;
            path.push(id);
            for &dep in &graph.deps[id.index()] {
                match marks[dep.index()] {
                    Mark::Active => {
                        let start = path.iter().position(|&p| p == dep).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(graph, dep, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[id.index()] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; self.stages.len()];
        for stage in &self.stages {
            if marks[stage.id.index()] == Mark::New {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, stage.id, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    pub fn stages(&self) -> &[ResolvedStage] {
        &self.stages
    }

    pub fn stage(&self, id: StageId) -> &ResolvedStage {
        &self.stages[id.index()]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn label(&self, id: StageId) -> String {
        self.stage(id).label()
    }

    /// The last declared stage.
    pub fn last_stage(&self) -> StageId {
        StageId(self.stages.len().saturating_sub(1))
    }

    /// Find a stage by name or index, for target selection.
    pub fn find_stage(&self, token: &str) -> Option<StageId> {
        if let Some(id) = self.names.get(&token.to_lowercase()) {
            return Some(*id);
        }
        token
            .parse::<usize>()
            .ok()
            .filter(|index| *index < self.stages.len())
            .map(StageId)
    }

    /// Stages `id` depends on directly.
    pub fn dependencies(&self, id: StageId) -> &BTreeSet<StageId> {
        &self.deps[id.index()]
    }

    /// Stages that depend directly on `id`.
    pub fn dependents(&self, id: StageId) -> Vec<StageId> {
        self.deps
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.contains(&id))
            .map(|(index, _)| StageId(index))
            .collect()
    }

    /// External images a stage reads (base or copy sources).
    pub fn external_images(&self, id: StageId) -> &[ImageReference] {
        &self.external[id.index()]
    }

    /// `target` plus everything it transitively depends on.
    pub fn closure(&self, target: StageId) -> BTreeSet<StageId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            if seen.insert(id) {
                stack.extend(self.deps[id.index()].iter().copied());
            }
        }
        seen
    }

    /// `target`, its base stage, that stage's base, and so on.
    pub fn base_chain(&self, target: StageId) -> Vec<StageId> {
        let mut chain = vec![target];
        let mut current = target;
        while let Some(base) = self.stage(current).base_stage() {
            chain.push(base);
            current = base;
        }
        chain
    }

    pub fn global_args(&self) -> &[GlobalArg] {
        &self.global_args
    }
}
