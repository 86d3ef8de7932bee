//! Per-contract session state.
//!
//! A session is created when a contract address is opened and replaced
//! when the address changes. The function list and history are swapped
//! wholesale on update, so readers holding an `Arc` never see a partial
//! write.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::reconcile::{self, ReconciledAbi};
use super::service::{ContractService, GasEstimateRequest};
use super::{BoundInput, ExplorerError, FunctionDescriptor, HistoryEntry};

/// Bounded call history, newest first.
#[derive(Debug, Clone)]
pub struct History {
    entries: Arc<Vec<HistoryEntry>>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Arc::new(Vec::new()),
            limit: limit.max(1),
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        let mut next = Vec::with_capacity(self.limit);
        next.push(entry);
        next.extend(self.entries.iter().take(self.limit - 1).cloned());
        self.entries = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<Vec<HistoryEntry>> {
        Arc::clone(&self.entries)
    }

    pub fn get(&self, index: usize) -> Option<&HistoryEntry> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Issued when an ABI fetch starts; only the newest ticket may apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    address: String,
    generation: u64,
}

impl FetchTicket {
    pub fn address(&self) -> &str {
        &self.address
    }
}

/// Identifies the session a detached call started from. A call result is
/// only recorded while the session it started from is still open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTicket {
    address: String,
    epoch: u64,
}

#[derive(Debug)]
pub struct Session {
    contract_address: String,
    abi: Option<Arc<ReconciledAbi>>,
    functions: Arc<Vec<FunctionDescriptor>>,
    selected: Option<String>,
    inputs: Vec<BoundInput>,
    history: History,
    fetch_generation: u64,
    epoch: u64,
}

impl Session {
    pub fn open(contract_address: &str, history_limit: usize) -> Self {
        info!("Opening session for {}", contract_address);
        Self {
            contract_address: contract_address.trim().to_string(),
            abi: None,
            functions: Arc::new(Vec::new()),
            selected: None,
            inputs: Vec::new(),
            history: History::new(history_limit),
            fetch_generation: 0,
            epoch: 0,
        }
    }

    pub fn contract_address(&self) -> &str {
        &self.contract_address
    }

    /// Starts over if `address` differs from the open one. Returns whether
    /// the session was reset.
    pub fn reset_for(&mut self, address: &str) -> bool {
        if self.contract_address.eq_ignore_ascii_case(address.trim()) {
            return false;
        }
        // keep the generation counter moving so in-flight fetches for the old address go stale
        let generation = self.fetch_generation + 1;
        let epoch = self.epoch + 1;
        *self = Self::open(address, self.history.limit);
        self.fetch_generation = generation;
        self.epoch = epoch;
        true
    }

    pub fn begin_fetch(&mut self) -> FetchTicket {
        self.fetch_generation += 1;
        FetchTicket {
            address: self.contract_address.clone(),
            generation: self.fetch_generation,
        }
    }

    /// Installs a reconciled ABI unless a newer fetch has started since
    /// `ticket` was issued.
    pub fn apply_abi(&mut self, ticket: &FetchTicket, abi: ReconciledAbi) -> bool {
        if !self.is_current(ticket) {
            debug!(
                "Discarding stale ABI for {} (generation {} < {})",
                ticket.address, ticket.generation, self.fetch_generation
            );
            return false;
        }

        self.functions = Arc::new(abi.functions.clone());
        self.abi = Some(Arc::new(abi));

        if let Some(selected) = &self.selected {
            if !self.functions.iter().any(|f| &f.signature() == selected) {
                self.selected = None;
                self.inputs.clear();
            }
        }
        true
    }

    pub fn is_current(&self, ticket: &FetchTicket) -> bool {
        ticket.generation == self.fetch_generation
            && ticket.address.eq_ignore_ascii_case(&self.contract_address)
    }

    /// Adds functions from another discovery source, skipping known
    /// signatures. Returns how many were new, or `None` for a stale ticket.
    pub fn merge_functions(
        &mut self,
        ticket: &FetchTicket,
        discovered: Vec<FunctionDescriptor>,
    ) -> Option<usize> {
        if !self.is_current(ticket) {
            debug!("Discarding stale functions for {}", ticket.address);
            return None;
        }
        let before = self.functions.len();
        let merged = reconcile::merge_discovered(&self.functions, discovered);
        let added = merged.len() - before;
        self.functions = Arc::new(merged);
        Some(added)
    }

    pub fn abi(&self) -> Option<Arc<ReconciledAbi>> {
        self.abi.clone()
    }

    pub fn functions(&self) -> Arc<Vec<FunctionDescriptor>> {
        Arc::clone(&self.functions)
    }

    pub fn find_function(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Selects by full signature, falling back to the first function of
    /// that name. Inputs are reset to empty values.
    pub fn select_function(&mut self, name_or_signature: &str) -> Result<&FunctionDescriptor, ExplorerError> {
        let key = name_or_signature.trim();
        let function = self
            .functions
            .iter()
            .find(|f| f.signature() == key)
            .or_else(|| self.functions.iter().find(|f| f.name == key))
            .cloned()
            .ok_or_else(|| ExplorerError::FunctionNotFound(key.to_string()))?;

        self.inputs = function
            .inputs
            .iter()
            .map(|p| BoundInput::new(p.name.clone(), p.canonical_type(), String::new()))
            .collect();
        self.selected = Some(function.signature());
        self.selected().ok_or_else(|| ExplorerError::FunctionNotFound(key.to_string()))
    }

    pub fn selected(&self) -> Option<&FunctionDescriptor> {
        let selected = self.selected.as_ref()?;
        self.functions.iter().find(|f| &f.signature() == selected)
    }

    /// Like `select_function`, but keeps the bound inputs when the function
    /// is already the selected one.
    pub fn ensure_selected(&mut self, name_or_signature: &str) -> Result<&FunctionDescriptor, ExplorerError> {
        let key = name_or_signature.trim();
        let already = self
            .selected()
            .is_some_and(|f| f.name == key || f.signature() == key);
        if already {
            return self
                .selected()
                .ok_or_else(|| ExplorerError::FunctionNotFound(key.to_string()));
        }
        self.select_function(key)
    }

    /// Binds a value by input name or positional index.
    pub fn set_input(&mut self, name_or_index: &str, value: &str) -> Result<(), ExplorerError> {
        if self.selected.is_none() {
            return Err(ExplorerError::NoFunctionSelected);
        }

        let slot = match name_or_index.parse::<usize>() {
            Ok(index) => self.inputs.get_mut(index),
            Err(_) => self.inputs.iter_mut().find(|i| i.name == name_or_index),
        }
        .ok_or_else(|| ExplorerError::UnknownInput(name_or_index.to_string()))?;

        slot.value = value.to_string();
        Ok(())
    }

    /// Binds all values positionally.
    pub fn bind_all(&mut self, values: &[String]) -> Result<(), ExplorerError> {
        let Some(function) = self.selected() else {
            return Err(ExplorerError::NoFunctionSelected);
        };
        if values.len() != function.inputs.len() {
            return Err(ExplorerError::Invalid(format!(
                "'{}' takes {} parameters, got {}",
                function.name,
                function.inputs.len(),
                values.len()
            )));
        }
        for (slot, value) in self.inputs.iter_mut().zip(values) {
            slot.value = value.clone();
        }
        Ok(())
    }

    pub fn inputs(&self) -> &[BoundInput] {
        &self.inputs
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn record(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    pub fn ticket(&self) -> SessionTicket {
        SessionTicket {
            address: self.contract_address.clone(),
            epoch: self.epoch,
        }
    }

    /// Records `entry` unless the session was reset since `ticket` was taken.
    pub fn record_if_current(&mut self, ticket: &SessionTicket, entry: HistoryEntry) -> bool {
        if ticket.epoch != self.epoch || !ticket.address.eq_ignore_ascii_case(&self.contract_address) {
            debug!("Dropping result of a call made against {}", ticket.address);
            return false;
        }
        self.record(entry);
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GasEstimate {
    Estimated(u64),
    /// A newer estimate started before this one finished.
    Superseded,
    Failed(String),
}

/// Debounced gas estimation for parameter edits.
#[derive(Debug)]
pub struct GasEstimator {
    generation: AtomicU64,
    debounce: Duration,
}

impl GasEstimator {
    pub fn new(debounce: Duration) -> Self {
        Self {
            generation: AtomicU64::new(0),
            debounce,
        }
    }

    pub async fn estimate<S>(&self, service: &S, request: GasEstimateRequest) -> GasEstimate
    where
        S: ContractService + ?Sized,
    {
        let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.debounce).await;

        if self.generation.load(Ordering::SeqCst) != ticket {
            return GasEstimate::Superseded;
        }

        let result = service.estimate_gas(&request).await;

        // a response that lands after a newer request started is dropped
        if self.generation.load(Ordering::SeqCst) != ticket {
            return GasEstimate::Superseded;
        }

        match result {
            Ok(gas) => GasEstimate::Estimated(gas),
            Err(e) => GasEstimate::Failed(e.message()),
        }
    }
}
