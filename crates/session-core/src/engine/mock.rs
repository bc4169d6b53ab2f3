//! In-memory media engine
//!
//! Keeps the element graph in a map, answers SDP with deterministic strings
//! and records every call so tests can assert on ordering. Creation delay and
//! failures can be injected.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use super::{
    ElementError, ElementErrorListener, ElementId, ElementKind, EngineError, IceCandidateListener,
    MediaEngine,
};
use crate::api::types::{IceCandidate, MediaType};

#[derive(Debug, Clone)]
struct MockElement {
    kind: String,
    pipeline: Option<ElementId>,
}

#[derive(Default)]
struct MockState {
    elements: HashMap<ElementId, MockElement>,
    released: HashSet<ElementId>,
    connections: Vec<(ElementId, ElementId, Option<MediaType>)>,
    remote_candidates: HashMap<ElementId, Vec<IceCandidate>>,
    ice_listeners: HashMap<ElementId, IceCandidateListener>,
    error_listeners: HashMap<ElementId, ElementErrorListener>,
    filter_calls: Vec<(ElementId, String, Value)>,
    local_candidates: Vec<IceCandidate>,
    failing_kinds: HashSet<String>,
    fail_pipelines: bool,
    create_delay: Option<Duration>,
    pipelines_created: usize,
}

/// Media engine double used by tests and local development
pub struct MockMediaEngine {
    state: Mutex<MockState>,
    next_id: AtomicU64,
}

impl MockMediaEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Delay every create call, to widen race windows in tests
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.state.lock().create_delay = delay;
    }

    /// Make creation of a kind (`"WebRtcEndpoint"`, `"PassThrough"`, ...) fail
    pub fn fail_element_kind(&self, kind: &str, fail: bool) {
        let mut state = self.state.lock();
        if fail {
            state.failing_kinds.insert(kind.to_string());
        } else {
            state.failing_kinds.remove(kind);
        }
    }

    pub fn fail_pipelines(&self, fail: bool) {
        self.state.lock().fail_pipelines = fail;
    }

    /// Candidates announced on every `gather_candidates` call
    pub fn set_local_candidates(&self, candidates: Vec<IceCandidate>) {
        self.state.lock().local_candidates = candidates;
    }

    /// Drop every element as a restarted engine would
    pub fn simulate_restart(&self) {
        let mut state = self.state.lock();
        let ids: Vec<ElementId> = state.elements.keys().cloned().collect();
        for id in ids {
            state.elements.remove(&id);
            state.ice_listeners.remove(&id);
            state.error_listeners.remove(&id);
        }
        state.connections.clear();
    }

    /// Fire an error event on `element`
    pub fn emit_error(&self, element: &ElementId, description: &str) -> bool {
        let listener = self.state.lock().error_listeners.get(element).cloned();
        match listener {
            Some(listener) => {
                listener(ElementError {
                    element: element.clone(),
                    error_type: "MEDIA_OBJECT_ERROR".to_string(),
                    description: description.to_string(),
                    error_code: 40_001,
                });
                true
            }
            None => false,
        }
    }

    pub fn pipelines_created(&self) -> usize {
        self.state.lock().pipelines_created
    }

    pub fn is_live(&self, element: &ElementId) -> bool {
        self.state.lock().elements.contains_key(element)
    }

    pub fn was_released(&self, element: &ElementId) -> bool {
        self.state.lock().released.contains(element)
    }

    /// Live elements of one kind
    pub fn live_elements(&self, kind: &str) -> Vec<ElementId> {
        let state = self.state.lock();
        let mut ids: Vec<ElementId> = state
            .elements
            .iter()
            .filter(|(_, el)| el.kind == kind)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_connected(&self, source: &ElementId, sink: &ElementId) -> bool {
        self.state
            .lock()
            .connections
            .iter()
            .any(|(s, k, _)| s == source && k == sink)
    }

    pub fn connections_from(&self, source: &ElementId) -> Vec<ElementId> {
        self.state
            .lock()
            .connections
            .iter()
            .filter(|(s, _, _)| s == source)
            .map(|(_, k, _)| k.clone())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Remote candidates delivered to `element`, in delivery order
    pub fn received_candidates(&self, element: &ElementId) -> Vec<IceCandidate> {
        self.state
            .lock()
            .remote_candidates
            .get(element)
            .cloned()
            .unwrap_or_default()
    }

    pub fn filter_calls(&self) -> Vec<(ElementId, String, Value)> {
        self.state.lock().filter_calls.clone()
    }

    fn next_element_id(&self, kind: &str) -> ElementId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        ElementId(format!("{}-{}", kind, n))
    }

    fn require_live(state: &MockState, element: &ElementId) -> Result<(), EngineError> {
        if state.elements.contains_key(element) {
            Ok(())
        } else {
            Err(EngineError::ElementNotFound(element.to_string()))
        }
    }
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn create_pipeline(&self) -> Result<ElementId, EngineError> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.fail_pipelines {
            return Err(EngineError::CreationFailed {
                kind: "MediaPipeline".to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let id = self.next_element_id("MediaPipeline");
        state.elements.insert(
            id.clone(),
            MockElement {
                kind: "MediaPipeline".to_string(),
                pipeline: None,
            },
        );
        state.pipelines_created += 1;
        Ok(id)
    }

    async fn create_element(
        &self,
        pipeline: &ElementId,
        kind: ElementKind,
    ) -> Result<ElementId, EngineError> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let label = kind.label();
        let mut state = self.state.lock();
        Self::require_live(&state, pipeline)?;
        if state.failing_kinds.contains(label) {
            return Err(EngineError::CreationFailed {
                kind: label.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        let id = self.next_element_id(label);
        state.elements.insert(
            id.clone(),
            MockElement {
                kind: label.to_string(),
                pipeline: Some(pipeline.clone()),
            },
        );
        Ok(id)
    }

    async fn release(&self, element: &ElementId) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        if state.elements.remove(element).is_none() {
            return Err(EngineError::ElementNotFound(element.to_string()));
        }
        state.released.insert(element.clone());

        // Releasing a pipeline releases everything inside it
        let children: Vec<ElementId> = state
            .elements
            .iter()
            .filter(|(_, el)| el.pipeline.as_ref() == Some(element))
            .map(|(id, _)| id.clone())
            .collect();
        for child in &children {
            state.elements.remove(child);
            state.released.insert(child.clone());
        }

        state.connections.retain(|(s, k, _)| {
            s != element && k != element && !children.contains(s) && !children.contains(k)
        });
        state.ice_listeners.remove(element);
        state.error_listeners.remove(element);
        Ok(())
    }

    async fn process_offer(&self, element: &ElementId, sdp_offer: &str) -> Result<String, EngineError> {
        let state = self.state.lock();
        Self::require_live(&state, element)?;
        if sdp_offer.is_empty() {
            return Err(EngineError::Negotiation {
                element: element.to_string(),
                reason: "empty offer".to_string(),
            });
        }
        Ok(format!("answer:{}", element))
    }

    async fn process_answer(&self, element: &ElementId, sdp_answer: &str) -> Result<String, EngineError> {
        let state = self.state.lock();
        Self::require_live(&state, element)?;
        Ok(sdp_answer.to_string())
    }

    async fn generate_offer(&self, element: &ElementId) -> Result<String, EngineError> {
        let state = self.state.lock();
        Self::require_live(&state, element)?;
        Ok(format!("offer:{}", element))
    }

    async fn connect(
        &self,
        source: &ElementId,
        sink: &ElementId,
        media_type: Option<MediaType>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        for el in [source, sink] {
            if !state.elements.contains_key(el) {
                return Err(EngineError::Connection {
                    source_element: source.to_string(),
                    sink: sink.to_string(),
                    reason: format!("{} does not exist", el),
                });
            }
        }
        let exists = state
            .connections
            .iter()
            .any(|(s, k, m)| s == source && k == sink && *m == media_type);
        if !exists {
            state
                .connections
                .push((source.clone(), sink.clone(), media_type));
        }
        Ok(())
    }

    async fn disconnect(
        &self,
        source: &ElementId,
        sink: &ElementId,
        media_type: Option<MediaType>,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let before = state.connections.len();
        state.connections.retain(|(s, k, m)| {
            !(s == source && k == sink && (media_type.is_none() || *m == media_type))
        });
        if state.connections.len() == before {
            return Err(EngineError::Connection {
                source_element: source.to_string(),
                sink: sink.to_string(),
                reason: "not connected".to_string(),
            });
        }
        Ok(())
    }

    async fn gather_candidates(&self, element: &ElementId) -> Result<(), EngineError> {
        let (listener, candidates) = {
            let state = self.state.lock();
            Self::require_live(&state, element)?;
            (
                state.ice_listeners.get(element).cloned(),
                state.local_candidates.clone(),
            )
        };
        if let Some(listener) = listener {
            for candidate in candidates {
                listener(candidate);
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        element: &ElementId,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::require_live(&state, element)?;
        state
            .remote_candidates
            .entry(element.clone())
            .or_default()
            .push(candidate.clone());
        Ok(())
    }

    async fn set_ice_candidate_listener(
        &self,
        element: &ElementId,
        listener: IceCandidateListener,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::require_live(&state, element)?;
        state.ice_listeners.insert(element.clone(), listener);
        Ok(())
    }

    async fn set_error_listener(
        &self,
        element: &ElementId,
        listener: ElementErrorListener,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        Self::require_live(&state, element)?;
        state.error_listeners.insert(element.clone(), listener);
        Ok(())
    }

    async fn exec_filter_method(
        &self,
        filter: &ElementId,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError> {
        let mut state = self.state.lock();
        match state.elements.get(filter) {
            Some(el) if el.kind == "Filter" => {}
            Some(_) => {
                return Err(EngineError::Other(format!("{} is not a filter", filter)));
            }
            None => return Err(EngineError::ElementNotFound(filter.to_string())),
        }
        state
            .filter_calls
            .push((filter.clone(), method.to_string(), params.clone()));
        Ok(json!({ "method": method, "result": "ok" }))
    }
}
