//! Filter chain between a publisher's WebRTC endpoint and its pass-through
//!
//! The chain is a single linear path `head -> f1 -> ... -> fn -> tail`.
//! Elements are only wired once the chain is connected (the publisher has
//! negotiated); before that they are just recorded.

use indexmap::IndexMap;
use serde_json::Value;

use crate::api::types::FilterDescriptor;
use crate::engine::{ElementId, EngineError, MediaEngine};

#[derive(Debug, Clone, PartialEq)]
pub struct FilterElement {
    pub element: ElementId,
    pub descriptor: FilterDescriptor,
}

#[derive(Debug, Default)]
pub struct FilterChain {
    filters: IndexMap<ElementId, FilterElement>,
    connected: bool,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn contains(&self, element: &ElementId) -> bool {
        self.filters.contains_key(element)
    }

    /// Filter closest to the pass-through
    pub fn last(&self) -> Option<&FilterElement> {
        self.filters.last().map(|(_, f)| f)
    }

    pub fn elements(&self) -> Vec<ElementId> {
        self.filters.keys().cloned().collect()
    }

    /// Wire `head -> filters... -> tail` for the first time
    pub async fn connect(
        &mut self,
        engine: &dyn MediaEngine,
        head: &ElementId,
        tail: &ElementId,
    ) -> Result<(), EngineError> {
        let mut prev = head.clone();
        for id in self.filters.keys() {
            engine.connect(&prev, id, None).await?;
            prev = id.clone();
        }
        engine.connect(&prev, tail, None).await?;
        self.connected = true;
        Ok(())
    }

    /// Plug `filter` in front of `tail`
    pub async fn append(
        &mut self,
        engine: &dyn MediaEngine,
        head: &ElementId,
        tail: &ElementId,
        filter: FilterElement,
    ) -> Result<(), EngineError> {
        if self.filters.contains_key(&filter.element) {
            return Err(EngineError::Other(format!(
                "Filter {} is already in the chain",
                filter.element
            )));
        }
        if self.connected {
            let prev = self
                .filters
                .last()
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| head.clone());
            if let Err(e) = engine.disconnect(&prev, tail, None).await {
                tracing::debug!("No link {} -> {} to break: {}", prev, tail, e);
            }
            engine.connect(&prev, &filter.element, None).await?;
            engine.connect(&filter.element, tail, None).await?;
        }
        self.filters.insert(filter.element.clone(), filter);
        Ok(())
    }

    /// Take `element` out of the chain, reconnect its neighbours, then release it
    pub async fn remove(
        &mut self,
        engine: &dyn MediaEngine,
        head: &ElementId,
        tail: &ElementId,
        element: &ElementId,
    ) -> Result<FilterElement, EngineError> {
        let Some(index) = self.filters.get_index_of(element) else {
            return Err(EngineError::ElementNotFound(element.to_string()));
        };

        if self.connected {
            let prev = match index {
                0 => head.clone(),
                i => self.filters.get_index(i - 1).map(|(id, _)| id.clone()).unwrap_or_else(|| head.clone()),
            };
            let next = self
                .filters
                .get_index(index + 1)
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| tail.clone());
            engine.connect(&prev, &next, None).await?;
        }

        let Some(removed) = self.filters.shift_remove(element) else {
            return Err(EngineError::ElementNotFound(element.to_string()));
        };
        if let Err(e) = engine.release(&removed.element).await {
            tracing::warn!("Failed to release filter {}: {}", removed.element, e);
        }
        Ok(removed)
    }

    /// Release every filter without rewiring
    pub async fn release_all(&mut self, engine: &dyn MediaEngine) {
        for (id, _) in self.filters.drain(..) {
            if let Err(e) = engine.release(&id).await {
                tracing::warn!("Failed to release filter {}: {}", id, e);
            }
        }
        self.connected = false;
    }

    pub async fn exec(
        &self,
        engine: &dyn MediaEngine,
        element: &ElementId,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError> {
        if !self.filters.contains_key(element) {
            return Err(EngineError::ElementNotFound(element.to_string()));
        }
        engine.exec_filter_method(element, method, params).await
    }
}
