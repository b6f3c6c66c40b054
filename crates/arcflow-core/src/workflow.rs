// In-memory workflow graph.
//
// The graph is loaded once at startup from a JSON document and never mutated
// afterwards. Links are the nodes; chains are named entry points. Cycles are
// permitted (revisits are capped by the job chain at execution time).

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;
use crate::job::JobStatus;
use crate::package::PackageStatus;

/// Exit-code table entry: where to go and what status to record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitCode {
    #[serde(default)]
    pub next_link_id: Option<Uuid>,
    #[serde(default)]
    pub job_status: Option<JobStatus>,
}

/// Whether a standard link runs once against the package directory or once
/// per matching file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskScope {
    #[default]
    Unit,
    Files,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardConfig {
    /// Command name handed to the task executor
    pub execute: String,
    /// Arguments template, interpolated against the replacement context
    #[serde(default)]
    pub arguments: String,
    #[serde(default)]
    pub scope: TaskScope,
    /// Only files whose group use matches (e.g. "original", "preservation")
    #[serde(default)]
    pub filter_file_group_use: Option<String>,
    /// Only files under this subdirectory of the package
    #[serde(default)]
    pub filter_subdirectory: Option<String>,
    /// Only files that are (or are not) known to the catalog
    #[serde(default)]
    pub filter_identified: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub label: String,
    pub link_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceConfig {
    pub choices: Vec<Choice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainChoice {
    pub label: String,
    pub chain_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainChoiceConfig {
    pub choices: Vec<ChainChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetVariableConfig {
    pub variable: String,
    #[serde(default)]
    pub value: String,
    /// Link id stashed with the variable for later link-pull
    #[serde(default)]
    pub chain_link_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetVariableConfig {
    pub variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDecisionConfig {
    /// Final package status recorded when this link completes
    pub outcome: PackageStatus,
}

/// Closed set of link behaviors, dispatched by the job runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "manager", rename_all = "snake_case")]
pub enum LinkManager {
    Standard(StandardConfig),
    Choice(ChoiceConfig),
    ChainChoice(ChainChoiceConfig),
    SetVariable(SetVariableConfig),
    GetVariable(GetVariableConfig),
    OutputDecision(OutputDecisionConfig),
}

impl LinkManager {
    pub fn kind(&self) -> &'static str {
        match self {
            LinkManager::Standard(_) => "standard",
            LinkManager::Choice(_) => "choice",
            LinkManager::ChainChoice(_) => "chain_choice",
            LinkManager::SetVariable(_) => "set_variable",
            LinkManager::GetVariable(_) => "get_variable",
            LinkManager::OutputDecision(_) => "output_decision",
        }
    }
}

/// One node of the workflow graph; executed as one job per package visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    #[serde(skip)]
    pub id: Uuid,
    #[serde(rename = "config")]
    pub manager: LinkManager,
    pub description: String,
    /// Microservice group label shown in status reporting
    pub group: String,
    #[serde(default)]
    pub exit_codes: HashMap<i32, ExitCode>,
    #[serde(default)]
    pub fallback_link_id: Option<Uuid>,
    #[serde(default)]
    pub fallback_job_status: Option<JobStatus>,
    /// Completion of this link ends the package's workflow
    #[serde(default)]
    pub end: bool,
    /// Completion of this link moves the package from Transfer to Ingest
    #[serde(default)]
    pub start_ingest: bool,
}

impl Link {
    pub fn is_terminal(&self) -> bool {
        self.end
    }

    /// Resolve the job's aggregate exit code against the exit-code table,
    /// falling back to the link's fallback edge when no entry matches.
    pub fn resolve_exit(&self, code: i32) -> (Option<Uuid>, JobStatus) {
        match self.exit_codes.get(&code) {
            Some(entry) => (
                entry.next_link_id,
                entry.job_status.unwrap_or(JobStatus::CompletedOk),
            ),
            None => (
                self.fallback_link_id,
                self.fallback_job_status.unwrap_or(JobStatus::Failed),
            ),
        }
    }

    fn has_outgoing_edges(&self) -> bool {
        match &self.manager {
            LinkManager::Choice(config) => !config.choices.is_empty(),
            LinkManager::ChainChoice(config) => !config.choices.is_empty(),
            // A get-variable link may jump to a link id stored at runtime.
            LinkManager::GetVariable(_) => true,
            _ => {
                self.exit_codes.values().any(|e| e.next_link_id.is_some())
                    || self.fallback_link_id.is_some()
            }
        }
    }
}

/// A named entry point into the graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    #[serde(skip)]
    pub id: Uuid,
    pub description: String,
    pub start_link_id: Uuid,
}

/// On-disk document shape.
#[derive(Debug, Deserialize)]
struct WorkflowDocument {
    chains: HashMap<Uuid, Chain>,
    links: HashMap<Uuid, Link>,
    /// Chain the engine enters for every new package
    initiator: Uuid,
}

/// The immutable workflow graph.
#[derive(Debug)]
pub struct Workflow {
    links: HashMap<Uuid, Arc<Link>>,
    chains: HashMap<Uuid, Arc<Chain>>,
    initiator: Uuid,
}

impl Workflow {
    /// Parse and validate a workflow document.
    pub fn from_reader(reader: impl Read) -> Result<Self, WorkflowError> {
        let document: WorkflowDocument = serde_json::from_reader(reader)?;
        Self::from_document(document)
    }

    pub fn from_json(raw: &str) -> Result<Self, WorkflowError> {
        let document: WorkflowDocument = serde_json::from_str(raw)?;
        Self::from_document(document)
    }

    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, WorkflowError> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    fn from_document(document: WorkflowDocument) -> Result<Self, WorkflowError> {
        let links: HashMap<Uuid, Arc<Link>> = document
            .links
            .into_iter()
            .map(|(id, mut link)| {
                link.id = id;
                (id, Arc::new(link))
            })
            .collect();
        let chains: HashMap<Uuid, Arc<Chain>> = document
            .chains
            .into_iter()
            .map(|(id, mut chain)| {
                chain.id = id;
                (id, Arc::new(chain))
            })
            .collect();

        let workflow = Self {
            links,
            chains,
            initiator: document.initiator,
        };
        workflow.validate()?;
        Ok(workflow)
    }

    pub fn get_link(&self, id: Uuid) -> Option<Arc<Link>> {
        self.links.get(&id).cloned()
    }

    pub fn get_chain(&self, id: Uuid) -> Option<Arc<Chain>> {
        self.chains.get(&id).cloned()
    }

    /// The chain every new package enters. Existence is checked at load.
    pub fn get_initiator(&self) -> Arc<Chain> {
        self.chains[&self.initiator].clone()
    }

    pub fn links(&self) -> impl Iterator<Item = &Arc<Link>> {
        self.links.values()
    }

    fn validate(&self) -> Result<(), WorkflowError> {
        let initiator = self
            .chains
            .get(&self.initiator)
            .ok_or_else(|| WorkflowError::invalid(format!("initiator chain {} does not exist", self.initiator)))?;
        self.require_link(initiator.start_link_id, "initiator start link")?;

        for chain in self.chains.values() {
            self.require_link(chain.start_link_id, &format!("chain {} start link", chain.id))?;
        }

        for link in self.links.values() {
            for (code, exit) in &link.exit_codes {
                if let Some(next) = exit.next_link_id {
                    self.require_link(next, &format!("link {} exit {code}", link.id))?;
                }
            }
            if let Some(fallback) = link.fallback_link_id {
                self.require_link(fallback, &format!("link {} fallback", link.id))?;
            }

            match &link.manager {
                LinkManager::Choice(config) => {
                    if config.choices.is_empty() {
                        return Err(WorkflowError::invalid(format!(
                            "choice link {} has an empty choice set",
                            link.id
                        )));
                    }
                    for choice in &config.choices {
                        self.require_link(choice.link_id, &format!("link {} choice", link.id))?;
                    }
                }
                LinkManager::ChainChoice(config) => {
                    if config.choices.is_empty() {
                        return Err(WorkflowError::invalid(format!(
                            "chain choice link {} has an empty choice set",
                            link.id
                        )));
                    }
                    for choice in &config.choices {
                        if !self.chains.contains_key(&choice.chain_id) {
                            return Err(WorkflowError::invalid(format!(
                                "link {} references missing chain {}",
                                link.id, choice.chain_id
                            )));
                        }
                    }
                }
                LinkManager::SetVariable(config) => {
                    if let Some(target) = config.chain_link_id {
                        self.require_link(target, &format!("link {} stored target", link.id))?;
                    }
                }
                LinkManager::OutputDecision(config) => {
                    if !matches!(
                        config.outcome,
                        PackageStatus::Complete | PackageStatus::Rejected | PackageStatus::Failed
                    ) {
                        return Err(WorkflowError::invalid(format!(
                            "output decision link {} must resolve to a final status",
                            link.id
                        )));
                    }
                }
                _ => {}
            }

            // "terminal" (no outgoing edges) and `end` must agree; a workflow
            // where they diverge is rejected rather than guessed at.
            let outgoing = link.has_outgoing_edges();
            if link.end && outgoing {
                return Err(WorkflowError::invalid(format!(
                    "link {} is marked end but has outgoing edges",
                    link.id
                )));
            }
            if !link.end && !outgoing {
                return Err(WorkflowError::invalid(format!(
                    "link {} has no outgoing edges but is not marked end",
                    link.id
                )));
            }
        }

        Ok(())
    }

    fn require_link(&self, id: Uuid, what: &str) -> Result<(), WorkflowError> {
        if self.links.contains_key(&id) {
            Ok(())
        } else {
            Err(WorkflowError::invalid(format!(
                "{what} references missing link {id}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn document(links: serde_json::Value, start: &str) -> String {
        serde_json::json!({
            "initiator": "11111111-1111-1111-1111-111111111111",
            "chains": {
                "11111111-1111-1111-1111-111111111111": {
                    "description": "Default",
                    "start_link_id": start,
                }
            },
            "links": links,
        })
        .to_string()
    }

    const LINK_A: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";
    const LINK_B: &str = "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb";

    #[test]
    fn test_load_two_link_workflow() {
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "standard", "execute": "echo"},
                    "description": "Say hello",
                    "group": "Verify transfer",
                    "exit_codes": {"0": {"next_link_id": LINK_B, "job_status": "completed_ok"}},
                },
                LINK_B: {
                    "config": {"manager": "output_decision", "outcome": "complete"},
                    "description": "Store AIP",
                    "group": "Store AIP",
                    "end": true,
                },
            }),
            LINK_A,
        );

        let workflow = Workflow::from_json(&raw).expect("workflow loads");
        let a = workflow.get_link(LINK_A.parse().unwrap()).unwrap();
        assert_eq!(a.resolve_exit(0).0, Some(LINK_B.parse().unwrap()));
        assert_eq!(workflow.get_initiator().start_link_id, a.id);
        assert!(workflow.get_link(LINK_B.parse().unwrap()).unwrap().is_terminal());
    }

    #[test]
    fn test_dangling_edge_rejected() {
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "standard", "execute": "echo"},
                    "description": "Broken",
                    "group": "Verify transfer",
                    "exit_codes": {"0": {"next_link_id": LINK_B}},
                },
            }),
            LINK_A,
        );
        let err = Workflow::from_json(&raw).unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid(_)));
    }

    #[test]
    fn test_end_and_terminal_must_agree() {
        // Outgoing edge on an end link
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "standard", "execute": "echo"},
                    "description": "Confused",
                    "group": "Verify transfer",
                    "end": true,
                    "fallback_link_id": LINK_A,
                },
            }),
            LINK_A,
        );
        assert!(Workflow::from_json(&raw).is_err());

        // No outgoing edge and not an end link
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "standard", "execute": "echo"},
                    "description": "Dead end",
                    "group": "Verify transfer",
                },
            }),
            LINK_A,
        );
        assert!(Workflow::from_json(&raw).is_err());
    }

    #[test]
    fn test_empty_choice_set_rejected() {
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "choice", "choices": []},
                    "description": "Pick",
                    "group": "Decide",
                },
            }),
            LINK_A,
        );
        assert!(Workflow::from_json(&raw).is_err());
    }

    #[test]
    fn test_fallback_used_when_exit_code_unmapped() {
        let raw = document(
            serde_json::json!({
                LINK_A: {
                    "config": {"manager": "standard", "execute": "echo"},
                    "description": "Flaky",
                    "group": "Verify transfer",
                    "fallback_link_id": LINK_B,
                    "fallback_job_status": "failed",
                },
                LINK_B: {
                    "config": {"manager": "output_decision", "outcome": "failed"},
                    "description": "Failed transfer",
                    "group": "Failed transfer",
                    "end": true,
                },
            }),
            LINK_A,
        );
        let workflow = Workflow::from_json(&raw).unwrap();
        let link = workflow.get_link(LINK_A.parse().unwrap()).unwrap();
        let (next, status) = link.resolve_exit(1);
        assert_eq!(next, Some(LINK_B.parse().unwrap()));
        assert_eq!(status, JobStatus::Failed);
    }
}
