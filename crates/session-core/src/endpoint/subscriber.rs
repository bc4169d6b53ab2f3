//! Subscriber endpoint: receives one publisher's stream

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use super::{EndpointContext, EndpointKind, MediaEndpoint, PublisherEndpoint};
use crate::api::types::IceCandidate;
use crate::errors::Result;

#[derive(Debug)]
pub struct SubscriberEndpoint {
    endpoint: Arc<MediaEndpoint>,
    publisher_public_id: String,
    publisher: RwLock<Option<Weak<PublisherEndpoint>>>,
    connected: AtomicBool,
}

/// Endpoint name of `subscriber`'s view of `stream_id`
pub fn subscriber_endpoint_name(subscriber_public_id: &str, stream_id: &str) -> String {
    format!("{}_{}", subscriber_public_id, stream_id)
}

impl SubscriberEndpoint {
    /// `stream_id` may be unknown while the publisher has not negotiated yet
    pub fn new(ctx: EndpointContext, publisher_public_id: impl Into<String>, stream_id: Option<&str>) -> Arc<Self> {
        let publisher_public_id = publisher_public_id.into();
        let name = subscriber_endpoint_name(
            &ctx.owner_public_id,
            stream_id.unwrap_or(&publisher_public_id),
        );
        Arc::new(Self {
            endpoint: MediaEndpoint::new(EndpointKind::Subscriber, name, ctx, publisher_public_id.clone()),
            publisher_public_id,
            publisher: RwLock::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn endpoint(&self) -> &Arc<MediaEndpoint> {
        &self.endpoint
    }

    pub fn name(&self) -> String {
        self.endpoint.name()
    }

    pub fn publisher_public_id(&self) -> &str {
        &self.publisher_public_id
    }

    pub fn is_connected_to_publisher(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_released(&self) -> bool {
        self.endpoint.is_released()
    }

    /// Negotiate with the subscribing client and attach to `publisher`.
    ///
    /// A failure while attaching means the publisher went away; the caller
    /// decides how to report it.
    pub async fn subscribe(&self, sdp_offer: &str, publisher: &Arc<PublisherEndpoint>) -> Result<String> {
        let web = self.endpoint.wait_created().await?;
        if let Some(stream_id) = publisher.stream_id() {
            self.endpoint
                .set_name(subscriber_endpoint_name(&self.endpoint.context().owner_public_id, &stream_id));
        }

        self.endpoint.register_ice_listener(&web).await?;
        let answer = self
            .endpoint
            .context()
            .engine
            .process_offer(&web, sdp_offer)
            .await?;
        self.endpoint.gather_candidates(&web).await?;
        publisher.connect_sink(&web).await?;

        *self.publisher.write() = Some(Arc::downgrade(publisher));
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(
            "Subscriber {} attached to {}",
            self.name(),
            publisher.name()
        );
        Ok(answer)
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.endpoint.add_ice_candidate(candidate).await
    }

    /// Detach from the publisher and release the engine endpoint
    pub async fn release(&self) {
        let publisher = self.publisher.write().take().and_then(|w| w.upgrade());
        if let (Some(publisher), Some(web)) = (publisher, self.endpoint.element()) {
            publisher.disconnect_sink(&web).await;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.endpoint.release().await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::Harness;
    use super::*;
    use crate::api::types::{MediaOptions, SdpType};
    use crate::errors::SessionError;

    #[tokio::test]
    async fn test_subscribe_connects_to_passthru() {
        let h = Harness::new().await;
        let publisher = PublisherEndpoint::new(h.context("p1", "A"));
        publisher.create(h.pipeline.clone());
        publisher
            .publish(SdpType::Offer, "v=0", MediaOptions::audio_video())
            .await
            .unwrap();
        let stream_id = publisher.stream_id().unwrap();

        let subscriber = SubscriberEndpoint::new(h.context("p2", "B"), "A", None);
        subscriber.endpoint().create(h.pipeline.clone());
        let answer = subscriber.subscribe("v=0", &publisher).await.unwrap();

        let web = subscriber.endpoint().element().unwrap();
        assert_eq!(answer, format!("answer:{}", web));
        assert!(h.engine.is_connected(&publisher.passthru().unwrap(), &web));
        assert!(subscriber.is_connected_to_publisher());
        assert_eq!(subscriber.name(), format!("B_{}", stream_id));

        subscriber.release().await;
        assert!(!h.engine.is_connected(&publisher.passthru().unwrap(), &web));
        assert!(h.engine.was_released(&web));
    }

    #[tokio::test]
    async fn test_subscribe_to_released_publisher() {
        let h = Harness::new().await;
        let publisher = PublisherEndpoint::new(h.context("p1", "A"));
        publisher.create(h.pipeline.clone());
        publisher
            .publish(SdpType::Offer, "v=0", MediaOptions::audio_video())
            .await
            .unwrap();
        publisher.release().await;

        let subscriber = SubscriberEndpoint::new(h.context("p2", "B"), "A", publisher.stream_id().as_deref());
        subscriber.endpoint().create(h.pipeline.clone());
        let err = subscriber.subscribe("v=0", &publisher).await.unwrap_err();
        assert!(matches!(err, SessionError::UserNotStreaming { .. }));
        assert!(!subscriber.is_connected_to_publisher());
    }
}
