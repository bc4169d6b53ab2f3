//! RTP relay toward another node
//!
//! Carries a participant's media between nodes. The node that owns the
//! participant answers; the other side produces the offer.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{EndpointContext, EndpointKind, MediaEndpoint, PublisherEndpoint};
use crate::api::types::SdpType;
use crate::engine::ElementId;
use crate::errors::Result;

#[derive(Debug)]
pub struct RelayEndpoint {
    endpoint: Arc<MediaEndpoint>,
    remote_node: RwLock<Option<String>>,
}

impl RelayEndpoint {
    pub fn new(ctx: EndpointContext) -> Arc<Self> {
        let name = format!("{}_relay", ctx.owner_public_id);
        let owner = ctx.owner_public_id.clone();
        Arc::new(Self {
            endpoint: MediaEndpoint::new(EndpointKind::Relay, name, ctx, owner),
            remote_node: RwLock::new(None),
        })
    }

    pub fn create(&self, pipeline: ElementId) -> bool {
        self.endpoint.create(pipeline)
    }

    pub fn endpoint(&self) -> &Arc<MediaEndpoint> {
        &self.endpoint
    }

    pub fn remote_node(&self) -> Option<String> {
        self.remote_node.read().clone()
    }

    pub fn set_remote_node(&self, node_id: impl Into<String>) {
        *self.remote_node.write() = Some(node_id.into());
    }

    /// Offer to send to the remote node
    pub async fn prepare_remote_connection(&self) -> Result<String> {
        let element = self.endpoint.wait_created().await?;
        let offer = self.endpoint.context().engine.generate_offer(&element).await?;
        Ok(offer)
    }

    pub async fn process_offer_or_answer(&self, sdp_type: SdpType, sdp: &str) -> Result<String> {
        let element = self.endpoint.wait_created().await?;
        let engine = &self.endpoint.context().engine;
        let response = match sdp_type {
            SdpType::Offer => engine.process_offer(&element, sdp).await?,
            SdpType::Answer => engine.process_answer(&element, sdp).await?,
        };
        Ok(response)
    }

    /// Send `publisher`'s stream out through this relay
    pub async fn forward_from(&self, publisher: &PublisherEndpoint) -> Result<ElementId> {
        let element = self.endpoint.wait_created().await?;
        publisher.connect_sink(&element).await?;
        Ok(element)
    }

    pub async fn release(&self) {
        self.endpoint.release().await;
    }
}
