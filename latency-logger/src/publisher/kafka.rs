//! A [`Publisher`] producing latency records to a Kafka topic.
//!
//! Records are keyed by URL and encoded as JSON. A publish only enqueues the record with
//! librdkafka; acknowledgements are collected by a background task so workers never wait on the
//! broker. While librdkafka's local queue is full the publish keeps retrying, which is where the
//! workers feel backpressure from the bus.
//!
//! A delivery that fails for a reason that will not go away (unreachable brokers, rejected
//! credentials) is remembered, and every later publish fails with [`PublishError::Fatal`].
use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use rdkafka::{
    config::ClientConfig,
    error::KafkaError,
    producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer},
    types::RDKafkaErrorCode,
    util::Timeout,
};
use tokio::sync::mpsc;

use super::{PublishError, Publisher};
use crate::record::LatencyRecord;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(100);

/// SSL client authentication settings.
#[derive(Debug, Clone)]
pub struct KafkaSsl {
    pub ca_location: String,
    pub certificate_location: String,
    pub key_location: String,
}

#[derive(Debug, Clone)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic: String,
    pub client_id: String,
    pub ssl: Option<KafkaSsl>,
    pub delivery_timeout: Duration,
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
    deliveries: mpsc::UnboundedSender<(String, DeliveryFuture)>,
    failure: Arc<OnceLock<String>>,
}

impl KafkaPublisher {
    /// Creates the producer and checks that the brokers answer for `config.topic` within the
    /// delivery timeout.
    ///
    /// Must be called from within a tokio runtime.
    pub async fn new(config: &KafkaConfig) -> Result<Self, PublishError> {
        let producer = producer(config)?;

        let client = producer.clone();
        let topic = config.topic.clone();
        let timeout = config.delivery_timeout;
        tokio::task::spawn_blocking(move || {
            client
                .client()
                .fetch_metadata(Some(&topic), Timeout::After(timeout))
                .map(|_| ())
        })
        .await
        .map_err(|err| PublishError::Fatal(err.to_string()))?
        .inspect_err(|err| tracing::error!(?err, "Kafka brokers are unreachable: {err}"))
        .map_err(|err| PublishError::Fatal(format!("Kafka brokers are unreachable: {err}")))?;

        Ok(Self::with_producer(producer, config))
    }

    fn with_producer(producer: FutureProducer, config: &KafkaConfig) -> Self {
        let (deliveries, receiver) = mpsc::unbounded_channel();
        let failure = Arc::new(OnceLock::new());
        tokio::spawn(report_deliveries(receiver, failure.clone()));

        Self {
            producer,
            topic: config.topic.clone(),
            delivery_timeout: config.delivery_timeout,
            deliveries,
            failure,
        }
    }

    fn failed(&self) -> Result<(), PublishError> {
        match self.failure.get() {
            Some(reason) => Err(PublishError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }
}

fn producer(config: &KafkaConfig) -> Result<FutureProducer, PublishError> {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.bootstrap_servers.as_str())
        .set("client.id", config.client_id.as_str())
        .set(
            "message.timeout.ms",
            config.delivery_timeout.as_millis().to_string(),
        );
    if let Some(ssl) = &config.ssl {
        client
            .set("security.protocol", "SSL")
            .set("ssl.ca.location", ssl.ca_location.as_str())
            .set("ssl.certificate.location", ssl.certificate_location.as_str())
            .set("ssl.key.location", ssl.key_location.as_str());
    }
    client
        .create()
        .inspect_err(|err| tracing::error!(?err, "Failed to create Kafka producer: {err}"))
        .map_err(|err| PublishError::Fatal(err.to_string()))
}

async fn report_deliveries(
    mut deliveries: mpsc::UnboundedReceiver<(String, DeliveryFuture)>,
    failure: Arc<OnceLock<String>>,
) {
    while let Some((url, delivery)) = deliveries.recv().await {
        match delivery.await {
            Ok(Ok(_)) => tracing::trace!(%url, "Latency record delivered"),
            Ok(Err((err, _))) => match classify(err) {
                PublishError::Fatal(reason) => {
                    tracing::error!(%url, %reason, "Kafka delivery failed, publishing stops");
                    let _ = failure.set(reason);
                }
                err => tracing::warn!(%url, ?err, "Kafka rejected latency record: {err}"),
            },
            Err(_) => tracing::warn!(%url, "Delivery report for latency record was lost"),
        }
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, record: &LatencyRecord) -> Result<(), PublishError> {
        self.failed()?;
        let payload = serde_json::to_vec(record)?;
        loop {
            let message = FutureRecord::to(&self.topic)
                .key(record.url.as_str())
                .payload(&payload);
            match self.producer.send_result(message) {
                Ok(delivery) => {
                    self.deliveries
                        .send((record.url.clone(), delivery))
                        .map_err(|_| PublishError::Closed)?;
                    return Ok(());
                }
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {}
                Err((err, _)) => return Err(classify(err)),
            }
            tracing::debug!("Kafka producer queue is full, waiting");
            tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
        }
    }

    async fn flush(&self) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        let timeout = self.delivery_timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|err| PublishError::Fatal(err.to_string()))?
            .map_err(classify)?;
        self.failed()
    }
}

fn classify(err: KafkaError) -> PublishError {
    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::MessageTimedOut
            | RDKafkaErrorCode::AllBrokersDown,
        ) => PublishError::Fatal(err.to_string()),
        _ if matches!(err, KafkaError::ClientCreation(_)) => PublishError::Fatal(err.to_string()),
        _ => PublishError::Rejected(err.to_string()),
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Utc;

    use super::*;
    use crate::record::Outcome;

    fn config(delivery_timeout: Duration) -> KafkaConfig {
        KafkaConfig {
            // Nothing listens on port 1.
            bootstrap_servers: "127.0.0.1:1".to_owned(),
            topic: "latency".to_owned(),
            client_id: "latency-logger-test".to_owned(),
            ssl: None,
            delivery_timeout,
        }
    }

    fn record() -> LatencyRecord {
        LatencyRecord {
            url: "https://example.com/".to_owned(),
            dispatch_time: Utc::now(),
            worker: "worker-1".to_owned(),
            outcome: Outcome::Success {
                status_code: 200,
                first_byte: Duration::from_millis(1),
                latency: Duration::from_millis(2),
            },
        }
    }

    #[test]
    fn undeliverable_messages_are_fatal() {
        assert_matches!(
            classify(KafkaError::MessageProduction(RDKafkaErrorCode::MessageTimedOut)),
            PublishError::Fatal(_)
        );
        assert_matches!(
            classify(KafkaError::MessageProduction(
                RDKafkaErrorCode::TopicAuthorizationFailed
            )),
            PublishError::Fatal(_)
        );
        assert_matches!(
            classify(KafkaError::ClientCreation("bad config".to_owned())),
            PublishError::Fatal(_)
        );
        assert_matches!(
            classify(KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageSizeTooLarge
            )),
            PublishError::Rejected(_)
        );
    }

    #[tokio::test]
    async fn unreachable_brokers_fail_at_startup() {
        let result = KafkaPublisher::new(&config(Duration::from_millis(500))).await;
        assert_matches!(result.err(), Some(PublishError::Fatal(_)));
    }

    #[tokio::test]
    async fn publish_returns_before_the_broker_acknowledges() {
        let config = config(Duration::from_secs(60));
        let publisher = KafkaPublisher::with_producer(producer(&config).unwrap(), &config);

        tokio::time::timeout(Duration::from_secs(1), publisher.publish(&record()))
            .await
            .expect("publish waited for an acknowledgement")
            .unwrap();
    }

    #[tokio::test]
    async fn timed_out_delivery_stops_later_publishes() {
        let config = config(Duration::from_millis(200));
        let publisher = KafkaPublisher::with_producer(producer(&config).unwrap(), &config);

        publisher.publish(&record()).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while publisher.failure.get().is_none() {
            assert!(tokio::time::Instant::now() < deadline, "delivery never timed out");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let result = publisher.publish(&record()).await;
        assert_matches!(result, Err(PublishError::Fatal(_)));
    }
}
