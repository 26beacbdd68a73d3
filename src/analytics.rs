use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{ANALYTICS_DEBOUNCE_MS, MAX_DOCS_PER_COLLECTION};
use crate::error::{AnalyticsError, StoreError};
use crate::extract::{month_key_of, province_of};
use crate::models::{AggregatedStats, FieldTally, Record, UnitCount, UnitRatings, RATING_FIELDS};
use crate::store::RecordStore;
use crate::units::{self, Unit};

#[derive(Debug, Clone, Copy)]
pub struct AnalyticsSettings {
    pub max_docs_per_collection: usize,
    pub debounce: Duration,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            max_docs_per_collection: MAX_DOCS_PER_COLLECTION,
            debounce: Duration::from_millis(ANALYTICS_DEBOUNCE_MS),
        }
    }
}

/// Keeps the `cap` oldest records (by creation time, then id); records
/// without a timestamp are dropped first.
pub fn truncate_oldest_first(records: &mut Vec<Record>, cap: usize) {
    if records.len() <= cap {
        return;
    }
    records.sort_by(|a, b| {
        (a.created_at.is_none(), a.created_at, a.id).cmp(&(b.created_at.is_none(), b.created_at, b.id))
    });
    records.truncate(cap);
}

/// Builds the statistics for every unit present in `fetched`. Units missing
/// from the map (failed fetches) contribute nothing.
pub fn aggregate(units: &[Unit], fetched: &BTreeMap<String, Vec<Record>>) -> AggregatedStats {
    let mut stats = AggregatedStats::default();

    for unit in units {
        let Some(records) = fetched.get(unit.id) else {
            continue;
        };

        for record in records {
            if let Some(month) = month_key_of(record) {
                *stats.by_month.entry(month).or_insert(0) += 1;
            }
            if let Some(province) = province_of(record) {
                *stats.by_province.entry(province.to_string()).or_insert(0) += 1;
            }
        }

        let count = records.len() as u64;
        stats.total += count;
        stats.by_unit.insert(
            unit.id.to_string(),
            UnitCount {
                label: unit.label.to_string(),
                count,
            },
        );

        if unit.rating_bearing {
            if let Some(ratings) = rate_unit(records) {
                stats.unit_ratings.insert(unit.id.to_string(), ratings);
            }
        }
    }

    stats
}

/// Satisfaction statistics for one unit; `None` when it has no records.
pub fn rate_unit(records: &[Record]) -> Option<UnitRatings> {
    if records.is_empty() {
        return None;
    }

    let mut by_field: BTreeMap<String, FieldTally> = RATING_FIELDS
        .iter()
        .map(|field| (field.to_string(), FieldTally::default()))
        .collect();
    let mut by_score: BTreeMap<u8, u64> = (1..=5).map(|score| (score, 0)).collect();
    let mut rated_count = 0u64;

    for record in records {
        let mut rated = false;
        for field in RATING_FIELDS {
            if let Some(score) = record.rating(field) {
                let tally = by_field.entry(field.to_string()).or_default();
                tally.sum += u64::from(score);
                tally.count += 1;
                *by_score.entry(score).or_insert(0) += 1;
                rated = true;
            }
        }
        if rated {
            rated_count += 1;
        }
    }

    let averages = by_field
        .iter()
        .map(|(field, tally)| {
            let average = (tally.count > 0)
                .then(|| format!("{:.2}", tally.sum as f64 / tally.count as f64));
            (field.clone(), average)
        })
        .collect();

    let (sum, count) = by_field
        .values()
        .fold((0u64, 0u64), |(sum, count), tally| (sum + tally.sum, count + tally.count));
    let overall_avg = if count == 0 {
        0.0
    } else {
        ((sum as f64 / count as f64) * 100.0).round() / 100.0
    };

    Some(UnitRatings {
        by_field,
        by_score,
        rated_count,
        total_records: records.len() as u64,
        averages,
        overall_avg,
    })
}

/// Trailing debounce: fires once `interval` after the most recent event.
#[derive(Debug, Clone)]
pub struct Debouncer {
    interval: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Records an event at `now`, pushing the deadline back.
    pub fn notify(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true (once) if the quiet period has elapsed by `now`.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

pub type Snapshot = Option<Arc<AggregatedStats>>;

pub struct Aggregator {
    store: Arc<dyn RecordStore>,
    units: Vec<Unit>,
    settings: AnalyticsSettings,
    published: watch::Sender<Snapshot>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn RecordStore>, settings: AnalyticsSettings) -> Self {
        Self::with_units(store, units::analytics_units(), settings)
    }

    pub fn with_units(store: Arc<dyn RecordStore>, units: Vec<Unit>, settings: AnalyticsSettings) -> Self {
        let (published, _) = watch::channel(None);
        Self {
            store,
            units,
            settings,
            published,
        }
    }

    pub fn snapshots(&self) -> watch::Receiver<Snapshot> {
        self.published.subscribe()
    }

    pub fn latest(&self) -> Snapshot {
        self.published.borrow().clone()
    }

    async fn fetch_units(&self) -> (BTreeMap<String, Vec<Record>>, usize) {
        let cap = self.settings.max_docs_per_collection;
        let mut tasks = JoinSet::new();

        for unit in &self.units {
            let store = Arc::clone(&self.store);
            let id = unit.id;
            tasks.spawn(async move { (id, store.fetch_all(id).await) });
        }

        let mut fetched = BTreeMap::new();
        let mut failed = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(mut records))) => {
                    if records.len() > cap {
                        warn!(unit = id, fetched = records.len(), cap, "truncating oversized collection");
                        truncate_oldest_first(&mut records, cap);
                    }
                    fetched.insert(id.to_string(), records);
                }
                Ok((id, Err(e))) => {
                    warn!(unit = id, error = %e, "skipping unit after fetch failure");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "unit fetch task failed");
                    failed += 1;
                }
            }
        }

        (fetched, failed)
    }

    /// Recomputes and publishes the statistics. When nothing could be
    /// fetched the previous snapshot stays published.
    pub async fn refresh(&self) -> Result<Arc<AggregatedStats>, AnalyticsError> {
        let (fetched, failed) = self.fetch_units().await;

        if fetched.is_empty() && failed > 0 {
            error!(failed, "analytics refresh failed, keeping last snapshot");
            return Err(AnalyticsError::NothingFetched { failed });
        }

        let stats = Arc::new(aggregate(&self.units, &fetched));
        info!(total = stats.total, units = fetched.len(), failed, "analytics refreshed");
        self.published.send_replace(Some(Arc::clone(&stats)));
        Ok(stats)
    }

    /// Subscribes to every rating-bearing collection. The returned watcher
    /// drives debounced refreshes once run.
    pub async fn watch_changes(self: &Arc<Self>) -> Result<ChangeWatcher, StoreError> {
        let (tx, events) = mpsc::unbounded_channel();
        let mut pumps = Vec::new();

        for unit in self.units.iter().filter(|unit| unit.rating_bearing) {
            let mut subscription = self.store.subscribe(unit.id).await?;
            let tx = tx.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(event) = subscription.next().await {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(ChangeWatcher {
            aggregator: Arc::clone(self),
            events,
            pumps,
            debouncer: Debouncer::new(self.settings.debounce),
        })
    }

    /// Subscribes before the first refresh so no change is missed.
    pub async fn start(self: &Arc<Self>) -> Result<ChangeWatcher, StoreError> {
        let watcher = self.watch_changes().await?;
        if let Err(e) = self.refresh().await {
            error!(error = %e, "initial analytics load failed");
        }
        Ok(watcher)
    }
}

pub struct ChangeWatcher {
    aggregator: Arc<Aggregator>,
    events: mpsc::UnboundedReceiver<crate::models::ChangeEvent>,
    pumps: Vec<JoinHandle<()>>,
    debouncer: Debouncer,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl ChangeWatcher {
    /// Runs until `shutdown` resolves or every feed has closed and no
    /// refresh is pending.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut feeds_open = true;

        loop {
            if !feeds_open && self.debouncer.deadline().is_none() {
                break;
            }

            tokio::select! {
                _ = &mut shutdown => break,
                event = self.events.recv(), if feeds_open => match event {
                    Some(event) => {
                        debug!(unit = %event.collection, op = ?event.op, "change notification");
                        self.debouncer.notify(Instant::now());
                    }
                    None => feeds_open = false,
                },
                _ = sleep_until_deadline(self.debouncer.deadline()) => {
                    if self.debouncer.fire(Instant::now()) {
                        if let Err(e) = self.aggregator.refresh().await {
                            warn!(error = %e, "debounced refresh failed");
                        }
                    }
                }
            }
        }
    }
}

impl Drop for ChangeWatcher {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fields;
    use crate::store::{MemoryStore, Subscription};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::{json, Value};
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use uuid::Uuid;

    fn record(fields: Value) -> Record {
        Record::new(fields.as_object().cloned().unwrap_or_default())
    }

    fn unit(id: &str) -> Unit {
        units::find(id).expect("registered unit")
    }

    fn quantity_only(scores: &[i64]) -> Vec<Record> {
        scores
            .iter()
            .map(|score| record(json!({ "ratingQuantity": score, "date": "2025-04-10" })))
            .collect()
    }

    #[test]
    fn field_sums_counts_and_averages() {
        let ratings = rate_unit(&quantity_only(&[3, 5, 4, 2, 5])).unwrap();
        assert_eq!(ratings.by_field["ratingQuantity"], FieldTally { sum: 19, count: 5 });
        assert_eq!(ratings.averages["ratingQuantity"].as_deref(), Some("3.80"));
        assert_eq!(ratings.averages["ratingTraining"], None);
        assert_eq!(ratings.by_field["ratingTraining"], FieldTally::default());
        assert_eq!(ratings.by_score[&5], 2);
        assert_eq!(ratings.by_score[&1], 0);
        assert_eq!(ratings.rated_count, 5);
        assert_eq!(ratings.total_records, 5);
        assert!((ratings.overall_avg - 3.8).abs() < 1e-9);
    }

    #[test]
    fn overall_average_spans_all_fields() {
        let records = vec![
            record(json!({ "ratingQuantity": 5, "ratingAttitude": "4" })),
            record(json!({ "ratingPromptness": 2, "ratingTraining": "n/a" })),
            record(json!({ "remarks": "no survey" })),
        ];
        let ratings = rate_unit(&records).unwrap();
        assert_eq!(ratings.rated_count, 2);
        assert_eq!(ratings.total_records, 3);
        assert!((ratings.overall_avg - 3.67).abs() < 1e-9);
        assert_eq!(ratings.by_score.values().sum::<u64>(), 3);
    }

    #[test]
    fn unrated_records_average_to_zero() {
        let ratings = rate_unit(&[record(json!({ "remarks": "none" }))]).unwrap();
        assert_eq!(ratings.rated_count, 0);
        assert_eq!(ratings.overall_avg, 0.0);
        assert!(ratings.averages.values().all(Option::is_none));
    }

    #[test]
    fn empty_unit_has_count_but_no_ratings() {
        let units = vec![unit("animal_feeds"), unit("food_safety")];
        let mut fetched = BTreeMap::new();
        fetched.insert("animal_feeds".to_string(), Vec::new());
        fetched.insert("food_safety".to_string(), quantity_only(&[4]));

        let stats = aggregate(&units, &fetched);
        assert_eq!(stats.by_unit["animal_feeds"].count, 0);
        assert!(!stats.unit_ratings.contains_key("animal_feeds"));
        assert!(stats.unit_ratings.contains_key("food_safety"));
        assert_eq!(stats.total, 1);
    }

    #[test]
    fn unrated_units_get_no_rating_block() {
        let units = vec![unit("rabies_control")];
        let mut fetched = BTreeMap::new();
        fetched.insert("rabies_control".to_string(), quantity_only(&[5, 5]));
        let stats = aggregate(&units, &fetched);
        assert_eq!(stats.by_unit["rabies_control"].count, 2);
        assert!(stats.unit_ratings.is_empty());
    }

    #[test]
    fn months_and_provinces_are_bucketed() {
        let units = vec![unit("disease_surveillance")];
        let mut fetched = BTreeMap::new();
        let mut undated = record(json!({ "province": "Mars" }));
        undated.created_at = None;
        fetched.insert(
            "disease_surveillance".to_string(),
            vec![
                record(json!({ "dateOfSurveillance": "2025-03-02", "municipality": "Sablayan" })),
                record(json!({ "dateOfSurveillance": "2025-03-28", "address": { "province": "palawan" } })),
                record(json!({ "dateOfSurveillance": "2025-04-01", "province": "Palawan" })),
                undated,
            ],
        );

        let stats = aggregate(&units, &fetched);
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_month["2025-03"], 2);
        assert_eq!(stats.by_month["2025-04"], 1);
        assert_eq!(stats.by_month.values().sum::<u64>(), 3);
        assert_eq!(stats.by_province["Palawan"], 2);
        assert_eq!(stats.by_province["Occidental Mindoro"], 1);
        assert_eq!(stats.by_province.len(), 2);
    }

    #[test]
    fn truncation_keeps_oldest_records() {
        let mut records: Vec<Record> = (0..5)
            .rev()
            .map(|day| {
                let mut rec = record(json!({ "day": day }));
                rec.created_at = Some(Utc.with_ymd_and_hms(2025, 1, 1 + day, 0, 0, 0).unwrap());
                rec
            })
            .collect();
        records[0].created_at = None;

        truncate_oldest_first(&mut records, 3);
        let days: Vec<_> = records.iter().map(|rec| rec.fields["day"].clone()).collect();
        assert_eq!(days, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn debouncer_resets_on_each_event() {
        let start = Instant::now();
        let interval = Duration::from_millis(2000);
        let mut debouncer = Debouncer::new(interval);
        assert!(!debouncer.fire(start));

        debouncer.notify(start);
        debouncer.notify(start + Duration::from_millis(1500));
        assert!(!debouncer.fire(start + Duration::from_millis(2500)));
        assert_eq!(
            debouncer.deadline(),
            Some(start + Duration::from_millis(3500))
        );
        assert!(debouncer.fire(start + Duration::from_millis(3500)));
        assert!(!debouncer.fire(start + Duration::from_millis(9000)));
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for (collection, count) in [("animal_feeds", 3), ("food_safety", 2), ("rabies_control", 4)] {
            for n in 0..count {
                let fields = json!({ "date": format!("2025-0{}-15", n + 1), "ratingQuantity": n + 2 });
                store.insert(collection, record(fields)).await;
            }
        }
        store
    }

    #[tokio::test]
    async fn failing_collection_is_skipped() {
        let store = seeded_store().await;
        store.mark_unavailable("food_safety").await;
        let aggregator = Aggregator::new(store, AnalyticsSettings::default());

        let stats = aggregator.refresh().await.unwrap();
        assert_eq!(stats.total, 7);
        assert!(!stats.by_unit.contains_key("food_safety"));
        assert_eq!(stats.by_unit["rabies_control"].count, 4);
        assert_eq!(stats.by_unit["dairy_products"].count, 0);
    }

    #[tokio::test]
    async fn refresh_is_idempotent_over_stable_input() {
        let aggregator = Aggregator::new(seeded_store().await, AnalyticsSettings::default());
        let first = serde_json::to_string(&*aggregator.refresh().await.unwrap()).unwrap();
        let second = serde_json::to_string(&*aggregator.refresh().await.unwrap()).unwrap();
        assert_eq!(first, second);
        assert!(first.contains("\"byUnit\""));
        assert!(first.contains("\"unitRatings\""));
    }

    #[tokio::test]
    async fn total_failure_keeps_previous_snapshot() {
        let store = seeded_store().await;
        let aggregator = Aggregator::with_units(
            store.clone(),
            vec![unit("animal_feeds"), unit("food_safety")],
            AnalyticsSettings::default(),
        );
        let good = aggregator.refresh().await.unwrap();
        assert_eq!(good.total, 5);

        store.mark_unavailable("animal_feeds").await;
        store.mark_unavailable("food_safety").await;
        let err = aggregator.refresh().await.unwrap_err();
        assert!(matches!(err, AnalyticsError::NothingFetched { failed: 2 }));
        assert_eq!(aggregator.latest().as_deref(), Some(&*good));
    }

    #[tokio::test]
    async fn oversized_collection_is_capped() {
        let store = seeded_store().await;
        let aggregator = Aggregator::with_units(
            store,
            vec![unit("rabies_control")],
            AnalyticsSettings {
                max_docs_per_collection: 2,
                ..AnalyticsSettings::default()
            },
        );
        let stats = aggregator.refresh().await.unwrap();
        assert_eq!(stats.by_unit["rabies_control"].count, 2);
        assert_eq!(stats.total, 2);
    }

    struct CountingStore {
        inner: MemoryStore,
        fetches: AtomicUsize,
        write_during_fetch: AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new(),
                fetches: AtomicUsize::new(0),
                write_during_fetch: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RecordStore for CountingStore {
        async fn fetch_all(&self, collection: &str) -> Result<Vec<Record>, StoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.write_during_fetch.swap(false, Ordering::SeqCst) {
                let fields = record(json!({ "ratingQuantity": 4 })).fields;
                self.inner.create("animal_feeds", fields).await?;
            }
            self.inner.fetch_all(collection).await
        }

        async fn create(&self, collection: &str, fields: Fields) -> Result<Uuid, StoreError> {
            self.inner.create(collection, fields).await
        }

        async fn update(&self, collection: &str, id: Uuid, fields: Fields) -> Result<(), StoreError> {
            self.inner.update(collection, id, fields).await
        }

        async fn delete(&self, collection: &str, id: Uuid) -> Result<(), StoreError> {
            self.inner.delete(collection, id).await
        }

        async fn subscribe(&self, collection: &str) -> Result<Subscription, StoreError> {
            self.inner.subscribe(collection).await
        }

        async fn disabled_units(&self) -> Result<BTreeSet<String>, StoreError> {
            self.inner.disabled_units().await
        }

        async fn set_disabled_units(&self, units: &BTreeSet<String>) -> Result<(), StoreError> {
            self.inner.set_disabled_units(units).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_changes_triggers_one_refresh() {
        let store = Arc::new(CountingStore::new());
        let aggregator = Arc::new(Aggregator::with_units(
            store.clone(),
            vec![unit("animal_feeds"), unit("rabies_control")],
            AnalyticsSettings::default(),
        ));

        let watcher = aggregator.watch_changes().await.unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(watcher.run(async move {
            let _ = stopped.await;
        }));

        for n in 0..5 {
            store
                .create("animal_feeds", record(json!({ "ratingQuantity": n % 5 + 1 })).fields)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        // Last notification was 300ms ago; the window closes 1700ms from now.
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);
        assert!(aggregator.latest().is_none());

        tokio::time::sleep(Duration::from_millis(200)).await;
        // One refresh fetches each of the two tracked units once.
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(aggregator.latest().map(|stats| stats.total), Some(5));

        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);

        let _ = stop.send(());
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unrated_collections_are_not_watched() {
        let store = Arc::new(CountingStore::new());
        let aggregator = Arc::new(Aggregator::with_units(
            store.clone(),
            vec![unit("animal_feeds"), unit("rabies_control")],
            AnalyticsSettings::default(),
        ));
        let watcher = aggregator.watch_changes().await.unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(watcher.run(async move {
            let _ = stopped.await;
        }));

        store.create("rabies_control", Fields::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 0);

        let _ = stop.send(());
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn writes_during_first_load_schedule_a_refresh() {
        let store = Arc::new(CountingStore::new());
        store.write_during_fetch.store(true, Ordering::SeqCst);
        let aggregator = Arc::new(Aggregator::with_units(
            store.clone(),
            vec![unit("animal_feeds"), unit("rabies_control")],
            AnalyticsSettings::default(),
        ));

        let watcher = aggregator.start().await.unwrap();
        assert_eq!(store.fetches.load(Ordering::SeqCst), 2);
        assert!(aggregator.latest().is_some());

        let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
        let running = tokio::spawn(watcher.run(async move {
            let _ = stopped.await;
        }));

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(store.fetches.load(Ordering::SeqCst), 4);
        assert_eq!(aggregator.latest().map(|stats| stats.total), Some(1));

        let _ = stop.send(());
        running.await.unwrap();
    }
}
