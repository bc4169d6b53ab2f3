//! Publisher endpoint
//!
//! A WebRTC endpoint feeding a pass-through element. Subscribers attach to the
//! pass-through, filters sit between the two.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex;

use super::filter::{FilterChain, FilterElement};
use super::{ElementSlot, EndpointContext, EndpointKind, MediaEndpoint};
use crate::api::types::{FilterDescriptor, IceCandidate, MediaOptions, SdpType, StreamProperty};
use crate::engine::{ElementId, ElementKind};
use crate::errors::{Result, SessionError};

#[derive(Debug)]
pub struct PublisherEndpoint {
    endpoint: Arc<MediaEndpoint>,
    passthru: ElementSlot,
    chain: Mutex<FilterChain>,
    pipeline: RwLock<Option<ElementId>>,
    stream_id: RwLock<Option<String>>,
    options: RwLock<Option<MediaOptions>>,
    negotiated_at: RwLock<Option<i64>>,
}

impl PublisherEndpoint {
    pub fn new(ctx: EndpointContext) -> Arc<Self> {
        let owner = ctx.owner_public_id.clone();
        Arc::new(Self {
            endpoint: MediaEndpoint::new(EndpointKind::Publisher, owner.clone(), ctx, owner),
            passthru: ElementSlot::new(),
            chain: Mutex::new(FilterChain::new()),
            pipeline: RwLock::new(None),
            stream_id: RwLock::new(None),
            options: RwLock::new(None),
            negotiated_at: RwLock::new(None),
        })
    }

    /// Start creating the WebRTC endpoint and the pass-through
    pub fn create(self: &Arc<Self>, pipeline: ElementId) -> bool {
        *self.pipeline.write() = Some(pipeline.clone());
        if !self.endpoint.create(pipeline.clone()) {
            return false;
        }
        if self.passthru.begin() {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let engine = this.endpoint.context().engine.clone();
                let result = engine.create_element(&pipeline, ElementKind::PassThrough).await;
                if let Err(e) = &result {
                    tracing::warn!("PassThrough for {} could not be created: {}", this.name(), e);
                }
                this.passthru.finish(engine.as_ref(), result).await;
            });
        }
        true
    }

    pub fn endpoint(&self) -> &Arc<MediaEndpoint> {
        &self.endpoint
    }

    pub fn name(&self) -> String {
        self.endpoint.name()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.stream_id.read().clone()
    }

    pub fn media_options(&self) -> Option<MediaOptions> {
        self.options.read().clone()
    }

    pub fn negotiated_at(&self) -> Option<i64> {
        *self.negotiated_at.read()
    }

    pub fn is_negotiated(&self) -> bool {
        self.negotiated_at.read().is_some()
    }

    pub fn is_released(&self) -> bool {
        self.endpoint.is_released()
    }

    pub fn passthru(&self) -> Option<ElementId> {
        self.passthru.get()
    }

    async fn wait_passthru(&self) -> Result<ElementId> {
        let what = format!("passthrough of {}", self.name());
        self.passthru
            .wait(self.endpoint.context().create_timeout, &what)
            .await
    }

    /// Negotiate the publisher's media and start ICE gathering.
    ///
    /// Returns the SDP answer (or the updated offer when `sdp` is an answer).
    pub async fn publish(&self, sdp_type: SdpType, sdp: &str, options: MediaOptions) -> Result<String> {
        let ctx = self.endpoint.context();
        let stream_id = options.generate_stream_id(&ctx.owner_public_id);

        let web = self.endpoint.wait_created().await?;
        let passthru = self.wait_passthru().await?;
        self.endpoint.set_name(stream_id.clone());

        {
            let mut chain = self.chain.lock().await;
            if !chain.is_connected() {
                chain.connect(ctx.engine.as_ref(), &web, &passthru).await?;
            }
        }
        if let Some(filter) = &options.filter {
            self.apply_filter(filter.clone()).await?;
        }
        if options.do_loopback {
            ctx.engine.connect(&passthru, &web, None).await?;
        }

        self.endpoint.register_ice_listener(&web).await?;
        let response = match sdp_type {
            SdpType::Offer => ctx.engine.process_offer(&web, sdp).await?,
            SdpType::Answer => ctx.engine.process_answer(&web, sdp).await?,
        };
        self.endpoint.gather_candidates(&web).await?;

        *self.stream_id.write() = Some(stream_id.clone());
        *self.options.write() = Some(options);
        *self.negotiated_at.write() = Some(chrono::Utc::now().timestamp_millis());
        tracing::info!("Publisher {} negotiated stream {}", ctx.owner_public_id, stream_id);
        Ok(response)
    }

    /// Feed this publisher's stream into `sink`
    pub async fn connect_sink(&self, sink: &ElementId) -> Result<()> {
        if self.is_released() {
            return Err(SessionError::user_not_streaming(&self.endpoint.context().owner_public_id));
        }
        let passthru = self.wait_passthru().await?;
        self.endpoint
            .context()
            .engine
            .connect(&passthru, sink, None)
            .await?;
        Ok(())
    }

    pub async fn disconnect_sink(&self, sink: &ElementId) {
        let Some(passthru) = self.passthru.get() else {
            return;
        };
        if let Err(e) = self
            .endpoint
            .context()
            .engine
            .disconnect(&passthru, sink, None)
            .await
        {
            tracing::debug!("Sink {} was not attached to {}: {}", sink, self.name(), e);
        }
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.endpoint.add_ice_candidate(candidate).await
    }

    /// Create a filter element and plug it in front of the pass-through
    pub async fn apply_filter(&self, descriptor: FilterDescriptor) -> Result<ElementId> {
        let ctx = self.endpoint.context();
        let pipeline = self
            .pipeline
            .read()
            .clone()
            .ok_or_else(|| SessionError::filter_not_applied("Publisher has no pipeline"))?;
        let web = self.endpoint.wait_created().await?;
        let passthru = self.wait_passthru().await?;

        let element = ctx
            .engine
            .create_element(&pipeline, ElementKind::Filter(descriptor.clone()))
            .await
            .map_err(|e| SessionError::filter_not_applied(e.to_string()))?;

        let mut chain = self.chain.lock().await;
        let filter = FilterElement {
            element: element.clone(),
            descriptor: descriptor.clone(),
        };
        if let Err(e) = chain.append(ctx.engine.as_ref(), &web, &passthru, filter).await {
            if let Err(release_err) = ctx.engine.release(&element).await {
                tracing::warn!("Failed to release rejected filter {}: {}", element, release_err);
            }
            return Err(SessionError::filter_not_applied(e.to_string()));
        }
        if let Some(options) = self.options.write().as_mut() {
            options.filter = Some(descriptor);
        }
        tracing::debug!("Filter {} applied to {}", element, self.name());
        Ok(element)
    }

    /// Remove the newest filter
    pub async fn remove_filter(&self) -> Result<FilterElement> {
        let ctx = self.endpoint.context();
        let mut chain = self.chain.lock().await;
        let element = chain
            .last()
            .map(|f| f.element.clone())
            .ok_or_else(|| SessionError::filter_not_applied(format!("{} has no filter applied", self.name())))?;
        let (web, passthru) = match (self.endpoint.element(), self.passthru.get()) {
            (Some(web), Some(passthru)) => (web, passthru),
            _ => return Err(SessionError::media_endpoint(format!("{} is not created", self.name()))),
        };

        let removed = chain
            .remove(ctx.engine.as_ref(), &web, &passthru, &element)
            .await
            .map_err(|e| SessionError::filter_not_applied(e.to_string()))?;
        let remaining = chain.last().map(|f| f.descriptor.clone());
        if let Some(options) = self.options.write().as_mut() {
            options.filter = remaining;
        }
        Ok(removed)
    }

    /// Invoke `method` on the newest filter
    pub async fn exec_filter_method(&self, method: &str, params: &Value) -> Result<Value> {
        let chain = self.chain.lock().await;
        let element = chain
            .last()
            .map(|f| f.element.clone())
            .ok_or_else(|| SessionError::filter_not_applied(format!("{} has no filter applied", self.name())))?;
        chain
            .exec(self.endpoint.context().engine.as_ref(), &element, method, params)
            .await
            .map_err(|e| SessionError::filter_not_applied(e.to_string()))
    }

    pub async fn filter_count(&self) -> usize {
        self.chain.lock().await.len()
    }

    pub async fn release_filters(&self) {
        self.chain
            .lock()
            .await
            .release_all(self.endpoint.context().engine.as_ref())
            .await;
        if let Some(options) = self.options.write().as_mut() {
            options.filter = None;
        }
    }

    /// Apply a client property change to the stored options
    pub fn update_property(&self, property: StreamProperty, value: &Value) -> bool {
        let mut guard = self.options.write();
        let Some(options) = guard.as_mut() else {
            return false;
        };
        match property {
            StreamProperty::AudioActive => match value.as_bool() {
                Some(active) => options.audio_active = active,
                None => return false,
            },
            StreamProperty::VideoActive => match value.as_bool() {
                Some(active) => options.video_active = active,
                None => return false,
            },
            StreamProperty::VideoDimensions => {
                options.video_dimensions = Some(match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
            StreamProperty::Filter => {
                options.filter = FilterDescriptor::from_value(value).ok();
            }
        }
        true
    }

    /// Release filters, the WebRTC endpoint and the pass-through
    pub async fn release(&self) {
        let engine = self.endpoint.context().engine.clone();
        self.chain.lock().await.release_all(engine.as_ref()).await;
        self.endpoint.release().await;
        self.passthru.release(engine.as_ref()).await;
    }
}
