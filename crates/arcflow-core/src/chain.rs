// Job chain: the stateful walk of the workflow graph for one package.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::workflow::{Chain, Link, Workflow};

/// Revisits of a single link permitted within one walk. Cycles are legal in
/// the graph; a package that loops past this is failed rather than spun
/// forever.
pub const MAX_LINK_VISITS: u32 = 64;

pub struct JobChain {
    workflow: Arc<Workflow>,
    chain: Arc<Chain>,
    chain_stack: Vec<Arc<Chain>>,
    current_link: Option<Arc<Link>>,
    link_history: Vec<Uuid>,
    visits: HashMap<Uuid, u32>,
}

impl JobChain {
    /// Start a walk at the chain's start link.
    pub fn new(workflow: Arc<Workflow>, chain: Arc<Chain>) -> Result<Self, EngineError> {
        let start = workflow.get_link(chain.start_link_id).ok_or_else(|| {
            EngineError::job_internal(format!(
                "chain {} starts at missing link {}",
                chain.id, chain.start_link_id
            ))
        })?;

        let mut job_chain = Self {
            workflow,
            chain,
            chain_stack: Vec::new(),
            current_link: None,
            link_history: Vec::new(),
            visits: HashMap::new(),
        };
        job_chain.enter(start)?;
        Ok(job_chain)
    }

    /// Resume a walk at a stored link position, for packages left
    /// mid-workflow by a previous process.
    pub fn at_link(workflow: Arc<Workflow>, link_id: Uuid) -> Result<Self, EngineError> {
        let link = workflow.get_link(link_id).ok_or_else(|| {
            EngineError::job_internal(format!("cannot resume at missing link {link_id}"))
        })?;
        let chain = workflow.get_initiator();

        let mut job_chain = Self {
            workflow,
            chain,
            chain_stack: Vec::new(),
            current_link: None,
            link_history: Vec::new(),
            visits: HashMap::new(),
        };
        job_chain.enter(link)?;
        Ok(job_chain)
    }

    pub fn current_link(&self) -> Option<Arc<Link>> {
        self.current_link.clone()
    }

    pub fn current_chain(&self) -> &Arc<Chain> {
        &self.chain
    }

    pub fn history(&self) -> &[Uuid] {
        &self.link_history
    }

    /// Move to the next link; `None` ends the walk.
    pub fn advance(&mut self, next_link_id: Option<Uuid>) -> Result<Option<Arc<Link>>, EngineError> {
        match next_link_id {
            None => {
                self.current_link = None;
                Ok(None)
            }
            Some(id) => {
                let link = self.workflow.get_link(id).ok_or_else(|| {
                    EngineError::job_internal(format!("workflow advanced to missing link {id}"))
                })?;
                self.enter(link.clone())?;
                Ok(Some(link))
            }
        }
    }

    /// Switch to another chain (chain-choice resolution). The current chain
    /// is stacked; the walk continues at the new chain's start link.
    pub fn switch_chain(&mut self, chain_id: Uuid) -> Result<Arc<Link>, EngineError> {
        let chain = self.workflow.get_chain(chain_id).ok_or_else(|| {
            EngineError::job_internal(format!("chain choice selected missing chain {chain_id}"))
        })?;
        let start = self.workflow.get_link(chain.start_link_id).ok_or_else(|| {
            EngineError::job_internal(format!(
                "chain {} starts at missing link {}",
                chain.id, chain.start_link_id
            ))
        })?;

        debug!(from = %self.chain.id, to = %chain.id, "switching chain");
        self.chain_stack.push(self.chain.clone());
        self.chain = chain;
        self.enter(start.clone())?;
        Ok(start)
    }

    fn enter(&mut self, link: Arc<Link>) -> Result<(), EngineError> {
        let visits = self.visits.entry(link.id).or_insert(0);
        *visits += 1;
        if *visits > MAX_LINK_VISITS {
            return Err(EngineError::job_internal(format!(
                "link {} visited more than {MAX_LINK_VISITS} times; aborting walk",
                link.id
            )));
        }
        self.link_history.push(link.id);
        self.current_link = Some(link);
        Ok(())
    }
}
