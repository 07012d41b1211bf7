//! Producer-to-subscriber fan-out of computed section contents.
//!
//! A plain mapping from producer name to the list of subscribing sections.
//! When a producer finishes, its computed content is pushed to every
//! registered subscriber (in registration order) so they avoid redundant API
//! calls. The global variant additionally remembers the first content ever
//! distributed per producer and replays it to late registrants; it exists for
//! the one AWS listing that is account-wide while its subscribers are built
//! per region.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use crate::section::{ComputedContent, Section};

pub type SharedSection = Rc<RefCell<dyn Section>>;

#[derive(Default)]
pub struct ResultDistributor {
    subscribers: BTreeMap<String, Vec<SharedSection>>,
}

impl ResultDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `subscriber` to `producer`'s fan-out list.
    pub fn register(&mut self, producer: &str, subscriber: SharedSection) {
        self.subscribers
            .entry(producer.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Push `content` to every subscriber of `producer` except the producer
    /// itself, in registration order.
    pub fn distribute(&self, producer: &str, content: &ComputedContent) {
        let Some(subscribers) = self.subscribers.get(producer) else {
            return;
        };
        for subscriber in subscribers {
            let mut subscriber = subscriber.borrow_mut();
            if subscriber.name() == producer {
                continue;
            }
            debug!(producer, subscriber = %subscriber.name(), "distributing content");
            subscriber.receive(producer, content);
        }
    }
}

/// Distributor for account-global producers.
///
/// Remembers the first `(producer, content)` pair per producer; `register`
/// replays all remembered pairs to the new subscriber, covering subscribers
/// created after the one-time global fetch already happened.
#[derive(Default)]
pub struct GlobalResultDistributor {
    inner: ResultDistributor,
    remembered: BTreeMap<String, ComputedContent>,
}

impl GlobalResultDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: &str, subscriber: SharedSection) {
        for (name, content) in &self.remembered {
            let mut sub = subscriber.borrow_mut();
            // Producers never receive their own content, replayed or not.
            if sub.name() == name.as_str() {
                continue;
            }
            debug!(producer = %name, subscriber = %sub.name(), "replaying remembered content");
            sub.receive(name, content);
        }
        self.inner.register(producer, subscriber);
    }

    pub fn distribute(&mut self, producer: &str, content: &ComputedContent) {
        self.remembered
            .entry(producer.to_string())
            .or_insert_with(|| content.clone());
        self.inner.distribute(producer, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::section::{ColleagueContents, RawContent, SectionResult};
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Probe {
        name: String,
        colleagues: ColleagueContents,
    }

    impl Probe {
        fn new(name: &str) -> SharedSection {
            Rc::new(RefCell::new(Self {
                name: name.to_string(),
                colleagues: ColleagueContents::default(),
            }))
        }
    }

    #[async_trait(?Send)]
    impl Section for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        fn region(&self) -> &str {
            "us-east-1"
        }
        fn cache_interval(&self) -> u64 {
            0
        }
        fn receive(&mut self, producer: &str, content: &ComputedContent) {
            self.colleagues.insert(producer, content);
        }
        fn colleague_contents(&self) -> &ColleagueContents {
            &self.colleagues
        }
        async fn fetch(&self) -> Result<Value> {
            Ok(Value::Null)
        }
        fn compute(&self, raw: &RawContent) -> Result<Value> {
            Ok(raw.payload.clone())
        }
        fn results(&self, _computed: &ComputedContent) -> Result<Vec<SectionResult>> {
            Ok(Vec::new())
        }
    }

    fn content(ts: i64) -> ComputedContent {
        ComputedContent {
            payload: serde_json::json!(["row"]),
            timestamp: ts,
        }
    }

    #[test]
    fn test_distribute_reaches_all_subscribers() {
        let mut distributor = ResultDistributor::new();
        let a = Probe::new("a");
        let b = Probe::new("b");
        distributor.register("producer", a.clone());
        distributor.register("producer", b.clone());

        distributor.distribute("producer", &content(10));

        assert!(a.borrow().colleague_contents().get("producer").is_some());
        assert!(b.borrow().colleague_contents().get("producer").is_some());
    }

    #[test]
    fn test_producer_never_notifies_itself() {
        let mut distributor = ResultDistributor::new();
        let me = Probe::new("producer");
        distributor.register("producer", me.clone());

        distributor.distribute("producer", &content(10));

        assert!(me.borrow().colleague_contents().get("producer").is_none());
    }

    #[test]
    fn test_unknown_producer_is_a_no_op() {
        let distributor = ResultDistributor::new();
        distributor.distribute("nobody", &content(10));
    }

    #[test]
    fn test_global_distributor_replays_to_late_registrants() {
        let mut distributor = GlobalResultDistributor::new();
        distributor.distribute("s3_summary", &content(42));

        // Subscriber shows up after the one-time fetch already happened.
        let late = Probe::new("s3");
        distributor.register("s3_summary", late.clone());

        let got = late.borrow();
        assert!(got.colleague_contents().get("s3_summary").is_some());
        assert_eq!(got.colleague_contents().max_timestamp, Some(42));
    }

    #[test]
    fn test_global_distributor_never_replays_to_the_producer() {
        let mut distributor = GlobalResultDistributor::new();
        distributor.distribute("s3_summary", &content(7));

        // The producer itself registering late must not self-receive.
        let me = Probe::new("s3_summary");
        distributor.register("s3_summary", me.clone());
        assert!(me.borrow().colleague_contents().get("s3_summary").is_none());
    }

    #[test]
    fn test_global_distributor_keeps_first_content() {
        let mut distributor = GlobalResultDistributor::new();
        distributor.distribute("s3_summary", &content(1));
        distributor.distribute("s3_summary", &content(2));

        let late = Probe::new("s3");
        distributor.register("s3_summary", late.clone());
        assert_eq!(late.borrow().colleague_contents().max_timestamp, Some(1));
    }
}
