//! Extraction jobs
//!
//! [`Harvester`] is the per-run context: it owns the session, the endpoint client, the
//! worker pool and the event channel, and drives the named jobs end to end:
//!
//! 1. log in
//! 2. fetch the reference lists (service groups, techniques) and persist them
//! 3. fan out one lookup per reference id pair, enrich every row with the pair, and
//!    stream the rows into a CSV file or a table
//!
//! The uncertainty components job fans out over single ids instead: the
//! `UncertaintyBudgetId`s of the uncertainty budgets already written to the destination.

use crate::config::{Config, OutputTarget};
use crate::db::Database;
use crate::endpoints::{EndpointClient, reference_ids};
use crate::error::Result;
use crate::fanout::{FanOut, cross_product, per_id};
use crate::session::{Browser, Credential, HttpBrowser, Session};
use crate::sink::{CsvSink, RowSink, TableSink, parse_csv, write_csv_file};
use crate::types::{BatchReport, Event, FailedPair, ReferenceId, Row, TaskPair, enrich_rows};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

/// CSV file holding the service group list
pub const SERVICE_CAPABILITIES_CSV: &str = "ServiceCapabilities.csv";
/// CSV file holding the technique list
pub const TECHNIQUES_CSV: &str = "TechniquesList.csv";
/// Table holding the service group list
pub const SERVICE_CAPABILITIES_TABLE: &str = "service_capabilities";
/// Table holding the technique list
pub const TECHNIQUES_TABLE: &str = "techniques";
/// Column of the uncertainty budgets the components job reads its ids from
pub const UNCERTAINTY_BUDGET_ID: &str = "UncertaintyBudgetId";

/// A named fan-out extraction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Job {
    /// Uncertainty budgets per (service group, technique)
    UncertaintyBudgets,
    /// Capabilities per (technique, certification)
    Capabilities,
    /// Uncertainty components per uncertainty budget
    UncertaintyComponents,
}

impl Job {
    /// Every job, in run order (components read the budgets written before them)
    pub const ALL: [Job; 3] = [
        Job::UncertaintyBudgets,
        Job::Capabilities,
        Job::UncertaintyComponents,
    ];

    /// Label used in logs, events and reports
    pub fn label(self) -> &'static str {
        match self {
            Job::UncertaintyBudgets => "uncertainty_budgets",
            Job::Capabilities => "capabilities",
            Job::UncertaintyComponents => "uncertainty_components",
        }
    }

    /// Destination table
    pub fn table(self) -> &'static str {
        self.label()
    }

    /// Destination CSV file name
    pub fn csv_file(self) -> &'static str {
        match self {
            Job::UncertaintyBudgets => "AllUncertaintyBudgets.csv",
            Job::Capabilities => "Capabilities.csv",
            Job::UncertaintyComponents => "CompleteUncertaintyBudgets.csv",
        }
    }

    /// Columns the pair's ids are written to, `a` first
    ///
    /// A single-id job has one column and only writes `a`.
    pub fn enrichment(self) -> &'static [&'static str] {
        match self {
            Job::UncertaintyBudgets => &["ServiceGroupId", "TechniqueId"],
            Job::Capabilities => &["TechniqueId", "CertificationId"],
            Job::UncertaintyComponents => &[UNCERTAINTY_BUDGET_ID],
        }
    }
}

/// The reference lists a run fans out over
#[derive(Clone, Debug, Default)]
pub struct ReferenceData {
    /// Rows of the service capabilities list
    pub service_groups: Vec<Row>,
    /// Rows of the technique list
    pub techniques: Vec<Row>,
    /// Service group ids, deduplicated in list order
    pub service_group_ids: Vec<ReferenceId>,
    /// Technique ids, deduplicated in list order
    pub technique_ids: Vec<ReferenceId>,
    /// Certification ids for the capabilities job
    pub certification_ids: Vec<ReferenceId>,
    /// Budget ids for the components job; `None` reads them from the uncertainty
    /// budgets at the run's destination when the job starts
    pub uncertainty_budget_ids: Option<Vec<ReferenceId>>,
}

/// Outcome of a whole run
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Rows in the service capabilities list
    pub service_groups: usize,
    /// Rows in the technique list
    pub techniques: usize,
    /// One report per job, in run order
    pub reports: Vec<BatchReport>,
}

impl RunSummary {
    /// Rows written by every job
    pub fn rows_written(&self) -> u64 {
        self.reports.iter().map(|r| r.rows_written).sum()
    }

    /// Failed pairs of every job
    pub fn failed_pairs(&self) -> impl Iterator<Item = (&str, &FailedPair)> {
        self.reports
            .iter()
            .flat_map(|r| r.failed.iter().map(move |f| (r.job.as_str(), f)))
    }

    /// True when every task of every job succeeded
    pub fn is_complete(&self) -> bool {
        self.reports.iter().all(BatchReport::is_complete)
    }
}

/// Where a run's rows go
enum Destination {
    Csv(PathBuf),
    Database(Arc<Database>),
}

/// Per-run context wiring session, endpoints, worker pool and sinks together
pub struct Harvester {
    config: Config,
    session: Arc<Session>,
    client: EndpointClient,
    fan_out: FanOut,
    events: broadcast::Sender<Event>,
}

impl Harvester {
    /// Build a harvester on top of any browsing capability
    pub fn new(config: Config, browser: Arc<dyn Browser>, credential: Credential) -> Result<Self> {
        config.validate()?;

        let session = Arc::new(Session::new(
            browser,
            config.auth.clone(),
            config.login_url()?,
            credential,
        ));
        let client = EndpointClient::new(Arc::clone(&session), config.base()?);
        let (events, _rx) = broadcast::channel(1000);
        let fan_out = FanOut::new(config.fanout.workers, events.clone());

        Ok(Self {
            config,
            session,
            client,
            fan_out,
            events,
        })
    }

    /// Build a harvester browsing over HTTP
    pub fn connect(config: Config, credential: Credential) -> Result<Self> {
        let browser = Arc::new(HttpBrowser::new(&config)?);
        Self::new(config, browser, credential)
    }

    /// Subscribe to progress events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The run's configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The authenticated session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// The endpoint client
    pub fn client(&self) -> &EndpointClient {
        &self.client
    }

    /// Log in (fatal on bad credentials)
    pub async fn login(&self) -> Result<()> {
        self.session.ensure_authenticated().await
    }

    /// Fetch both reference lists and project their id columns
    pub async fn collect_reference_data(&self) -> Result<ReferenceData> {
        let endpoints = &self.config.endpoints;

        let service_groups = self.client.fetch_list(&endpoints.service_capabilities).await?;
        let techniques = self.client.fetch_flat(&endpoints.techniques).await?;

        let refs = ReferenceData {
            service_group_ids: distinct(reference_ids(
                &service_groups,
                &endpoints.service_capabilities.id_field,
            )?),
            technique_ids: distinct(reference_ids(&techniques, &endpoints.techniques.id_field)?),
            certification_ids: distinct(
                endpoints
                    .certification_ids
                    .iter()
                    .copied()
                    .map(ReferenceId)
                    .collect(),
            ),
            uncertainty_budget_ids: None,
            service_groups,
            techniques,
        };

        tracing::info!(
            service_groups = refs.service_groups.len(),
            techniques = refs.techniques.len(),
            "Loaded reference lists"
        );
        self.emit(Event::ReferencesLoaded {
            service_groups: refs.service_groups.len(),
            techniques: refs.techniques.len(),
        });

        Ok(refs)
    }

    /// Log in, fetch the reference lists and run `jobs`
    pub async fn run(&self, jobs: &[Job]) -> Result<RunSummary> {
        self.login().await?;
        let refs = self.collect_reference_data().await?;
        self.run_with_references(jobs, &refs).await
    }

    /// Persist `refs` and run `jobs` over them
    ///
    /// Stops at the first job that returns an error (a fail-fast task failure, a fatal
    /// error such as a rejected re-login, or a buffered write failure).
    pub async fn run_with_references(
        &self,
        jobs: &[Job],
        refs: &ReferenceData,
    ) -> Result<RunSummary> {
        let destination = self.open_destination().await?;
        self.persist_reference_data(&destination, refs).await?;

        let mut summary = RunSummary {
            service_groups: refs.service_groups.len(),
            techniques: refs.techniques.len(),
            reports: Vec::with_capacity(jobs.len()),
        };
        for &job in jobs {
            let pairs = match (job, &refs.uncertainty_budget_ids) {
                (Job::UncertaintyComponents, None) => {
                    per_id(&self.stored_budget_ids(&destination).await?)
                }
                _ => self.pairs_for(job, refs),
            };
            let report = self.run_job(&destination, job, pairs).await?;
            summary.reports.push(report);
        }

        if let Destination::Database(db) = destination {
            db.pool().close().await;
        }

        tracing::info!(
            jobs = summary.reports.len(),
            rows = summary.rows_written(),
            complete = summary.is_complete(),
            "Run finished"
        );
        Ok(summary)
    }

    /// Release the browsing capability
    pub async fn close(&self) {
        self.session.close().await;
    }

    /// Pairs a job fans out over
    pub fn pairs_for(&self, job: Job, refs: &ReferenceData) -> Vec<TaskPair> {
        match job {
            Job::UncertaintyBudgets => {
                cross_product(&refs.service_group_ids, &refs.technique_ids)
            }
            Job::Capabilities => cross_product(&refs.technique_ids, &refs.certification_ids),
            Job::UncertaintyComponents => {
                per_id(refs.uncertainty_budget_ids.as_deref().unwrap_or_default())
            }
        }
    }

    /// Distinct budget ids of the uncertainty budgets already written to the destination
    ///
    /// Empty when the budgets table or CSV file does not exist yet.
    async fn stored_budget_ids(&self, destination: &Destination) -> Result<Vec<ReferenceId>> {
        let table = Job::UncertaintyBudgets.table();
        let ids = match destination {
            Destination::Database(db) => {
                if !db.table_exists(table).await? {
                    tracing::warn!(table, "No uncertainty budgets stored yet");
                    return Ok(Vec::new());
                }
                db.reference_ids(table, UNCERTAINTY_BUDGET_ID).await?
            }
            Destination::Csv(dir) => {
                let path = dir.join(Job::UncertaintyBudgets.csv_file());
                if !tokio::fs::try_exists(&path).await? {
                    tracing::warn!(path = %path.display(), "No uncertainty budgets stored yet");
                    return Ok(Vec::new());
                }
                distinct(csv_ids(&path, UNCERTAINTY_BUDGET_ID).await?)
            }
        };
        tracing::info!(budgets = ids.len(), "Uncertainty budget ids loaded");
        Ok(ids)
    }

    async fn fetch_rows(&self, job: Job, pair: TaskPair) -> Result<Vec<Row>> {
        let endpoints = &self.config.endpoints;
        let retry = &self.config.retry;
        let mut rows = match job {
            Job::UncertaintyBudgets => {
                self.client
                    .fetch_lookup_with_retry(retry, &endpoints.uncertainty_budgets, pair.a, pair.b)
                    .await?
            }
            Job::Capabilities => {
                self.client
                    .fetch_lookup_with_retry(retry, &endpoints.capabilities, pair.a, pair.b)
                    .await?
            }
            Job::UncertaintyComponents => {
                self.client
                    .fetch_detail_with_retry(retry, &endpoints.uncertainty_components, pair.a)
                    .await?
            }
        };
        let columns: Vec<(&str, ReferenceId)> = job
            .enrichment()
            .iter()
            .copied()
            .zip([pair.a, pair.b])
            .collect();
        enrich_rows(&mut rows, &columns);
        Ok(rows)
    }

    async fn run_job(
        &self,
        destination: &Destination,
        job: Job,
        pairs: Vec<TaskPair>,
    ) -> Result<BatchReport> {
        let sink = self
            .open_sink(destination, job.table(), job.csv_file())
            .await?;

        let fetch = |pair: TaskPair| self.fetch_rows(job, pair);

        let result = self
            .fan_out
            .run(
                job.label(),
                pairs,
                fetch,
                sink.as_ref(),
                self.config.fanout.mode,
                self.config.fanout.failure_policy,
            )
            .await;
        let finished = sink.finish().await;

        let report = result?;
        finished?;
        Ok(report)
    }

    async fn persist_reference_data(
        &self,
        destination: &Destination,
        refs: &ReferenceData,
    ) -> Result<()> {
        for (rows, table, file) in [
            (
                &refs.service_groups,
                SERVICE_CAPABILITIES_TABLE,
                SERVICE_CAPABILITIES_CSV,
            ),
            (&refs.techniques, TECHNIQUES_TABLE, TECHNIQUES_CSV),
        ] {
            match destination {
                Destination::Csv(dir) => {
                    write_csv_file(&dir.join(file), rows).await?;
                }
                Destination::Database(_) => {
                    let sink = self.open_sink(destination, table, file).await?;
                    sink.write_rows(rows).await?;
                    sink.finish().await?;
                }
            }
        }
        Ok(())
    }

    async fn open_destination(&self) -> Result<Destination> {
        let output = &self.config.output;
        Ok(match output.target {
            OutputTarget::Csv => Destination::Csv(output.csv_dir.clone()),
            OutputTarget::Database => {
                Destination::Database(Arc::new(Database::new(&output.database_path).await?))
            }
        })
    }

    async fn open_sink(
        &self,
        destination: &Destination,
        table: &str,
        file: &str,
    ) -> Result<Box<dyn RowSink>> {
        let output = &self.config.output;
        Ok(match destination {
            Destination::Csv(dir) => Box::new(CsvSink::create(&dir.join(file)).await?),
            Destination::Database(db) => Box::new(
                TableSink::open(Arc::clone(db), table, output.if_exists, output.chunk_size)
                    .await?,
            ),
        })
    }

    fn emit(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine - we just drop the event
        self.events.send(event).ok();
    }
}

/// Integer ids in `column` of a CSV file written by [`CsvSink`]
async fn csv_ids(path: &Path, column: &str) -> Result<Vec<ReferenceId>> {
    let text = tokio::fs::read_to_string(path).await?;
    let mut records = parse_csv(&text).into_iter();
    let Some(header) = records.next() else {
        return Ok(Vec::new());
    };
    let rows: Vec<Row> = records
        .map(|record| {
            header
                .iter()
                .cloned()
                .zip(record.into_iter().map(Value::String))
                .collect()
        })
        .collect();
    reference_ids(&rows, column)
}

fn distinct(ids: Vec<ReferenceId>) -> Vec<ReferenceId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter().filter(|id| seen.insert(*id)).collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CollectionMode, FailurePolicy};
    use crate::error::{Error, ErrorKind};
    use crate::test_helpers::{Reply, ScriptedBrowser, test_config};
    use serde_json::json;
    use tempfile::TempDir;

    const BUDGETS: &str = "/ServiceGroupTechnique/UncertaintyBudgets?sort=&group=&filter=";

    fn harvester(browser: &Arc<ScriptedBrowser>, config: Config) -> Harvester {
        Harvester::new(
            config,
            Arc::clone(browser) as Arc<dyn Browser>,
            Credential::new("user@example.com", "hunter2"),
        )
        .unwrap()
    }

    fn scripted_references(browser: &ScriptedBrowser) {
        browser.serve(
            "/ServiceType/ServiceCapabilities",
            r#"{"views": [{"ServiceGroupId": 1, "Name": "Dimensional"}]}"#,
        );
        browser.serve(
            "/ServiceGroupTechnique/TechniquesList",
            r#"[{"TechniqueId": 10, "Name": "Gauge blocks"}]"#,
        );
    }

    fn csv_config(dir: &TempDir) -> Config {
        let mut config = test_config();
        config.output.csv_dir = dir.path().to_path_buf();
        config
    }

    #[tokio::test]
    async fn test_end_to_end_single_pair_to_csv() {
        let browser = Arc::new(ScriptedBrowser::new());
        scripted_references(&browser);
        browser.serve(
            &format!("{}&serviceGroupId=1&techniqueId=10", BUDGETS),
            r#"{"Data": [{"BudgetId": 1, "Value": "X"}], "Total": 1}"#,
        );
        let dir = TempDir::new().unwrap();
        let harvester = harvester(&browser, csv_config(&dir));

        let summary = harvester.run(&[Job::UncertaintyBudgets]).await.unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.rows_written(), 1);
        assert_eq!(browser.logins(), 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("AllUncertaintyBudgets.csv")).unwrap(),
            "BudgetId,Value,ServiceGroupId,TechniqueId\n1,X,1,10\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(TECHNIQUES_CSV)).unwrap(),
            "TechniqueId,Name\n10,Gauge blocks\n"
        );
        assert!(dir.path().join(SERVICE_CAPABILITIES_CSV).exists());
    }

    #[tokio::test]
    async fn test_end_to_end_single_pair_to_database() {
        let browser = Arc::new(ScriptedBrowser::new());
        scripted_references(&browser);
        browser.serve(
            &format!("{}&serviceGroupId=1&techniqueId=10", BUDGETS),
            r#"{"Data": [{"BudgetId": 1, "Value": "X"}]}"#,
        );
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.output.target = OutputTarget::Database;
        config.output.database_path = dir.path().join("qualer.db");
        let harvester = harvester(&browser, config);

        harvester.run(&[Job::UncertaintyBudgets]).await.unwrap();

        let db = Database::new(&dir.path().join("qualer.db")).await.unwrap();
        let rows = db.select_rows("uncertainty_budgets").await.unwrap();
        assert_eq!(
            rows,
            vec![
                json!({"BudgetId": 1, "Value": "X", "ServiceGroupId": 1, "TechniqueId": 10})
                    .as_object()
                    .cloned()
                    .unwrap()
            ]
        );
        assert_eq!(db.count_rows(TECHNIQUES_TABLE).await.unwrap(), 1);
        assert_eq!(db.count_rows(SERVICE_CAPABILITIES_TABLE).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capabilities_job_crosses_techniques_with_certifications() {
        let browser = Arc::new(ScriptedBrowser::new());
        let dir = TempDir::new().unwrap();
        let mut config = csv_config(&dir);
        config.endpoints.certification_ids = vec![284, 300];
        let harvester = harvester(&browser, config);
        let capabilities =
            "/CertificationCapability/Capabilities_Read?sort=&group=&filter=&techniqueId=10";
        browser.serve(
            &format!("{}&certificationId=284", capabilities),
            r#"{"Data": [{"CapabilityId": 7}]}"#,
        );
        browser.serve(
            &format!("{}&certificationId=300", capabilities),
            r#"{"Data": []}"#,
        );
        let refs = ReferenceData {
            technique_ids: vec![ReferenceId(10)],
            certification_ids: vec![ReferenceId(284), ReferenceId(300)],
            ..Default::default()
        };

        let summary = harvester
            .run_with_references(&[Job::Capabilities], &refs)
            .await
            .unwrap();

        assert_eq!(summary.reports[0].succeeded, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("Capabilities.csv")).unwrap(),
            "CapabilityId,TechniqueId,CertificationId\n7,10,284\n"
        );
    }

    #[tokio::test]
    async fn test_best_effort_run_reports_failed_pairs() {
        let browser = Arc::new(ScriptedBrowser::new());
        scripted_references(&browser);
        browser.script(
            &format!("{}&serviceGroupId=1&techniqueId=10", BUDGETS),
            vec![Reply::Stale],
        );
        let dir = TempDir::new().unwrap();
        let harvester = harvester(&browser, csv_config(&dir));

        let summary = harvester.run(&[Job::UncertaintyBudgets]).await.unwrap();

        let failed: Vec<_> = summary.failed_pairs().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "uncertainty_budgets");
        assert_eq!(failed[0].1.kind, ErrorKind::TransientRender);
        assert!(!summary.is_complete());
        // 2 reference lists + 3 attempts at the lookup
        assert_eq!(browser.opens(), 5);
    }

    #[tokio::test]
    async fn test_fail_fast_run_returns_task_error() {
        let browser = Arc::new(ScriptedBrowser::new());
        scripted_references(&browser);
        browser.serve(
            &format!("{}&serviceGroupId=1&techniqueId=10", BUDGETS),
            r#"{"Errors": "grid failed"}"#,
        );
        let dir = TempDir::new().unwrap();
        let mut config = csv_config(&dir);
        config.fanout.failure_policy = FailurePolicy::FailFast;
        config.fanout.mode = CollectionMode::Buffer;
        let harvester = harvester(&browser, config);

        let err = harvester.run(&[Job::UncertaintyBudgets]).await.unwrap_err();

        assert!(matches!(err, Error::Task { .. }));
        assert_eq!(err.kind(), ErrorKind::Schema);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("AllUncertaintyBudgets.csv")).unwrap(),
            "",
            "buffered rows are not written after a fail-fast halt"
        );
    }

    #[tokio::test]
    async fn test_bad_credentials_stop_before_any_fetch() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.reject_logins();
        let dir = TempDir::new().unwrap();
        let harvester = harvester(&browser, csv_config(&dir));

        let err = harvester.run(&Job::ALL).await.unwrap_err();

        assert!(matches!(err, Error::Authentication { .. }));
        assert_eq!(browser.opens(), 0);
        assert!(browser.is_closed());
    }

    #[tokio::test]
    async fn test_rejected_relogin_ends_best_effort_run() {
        let browser = Arc::new(ScriptedBrowser::new());
        for technique in 10..14 {
            browser.script(
                &format!("{}&serviceGroupId=1&techniqueId={}", BUDGETS, technique),
                vec![Reply::LoginRedirect],
            );
        }
        let dir = TempDir::new().unwrap();
        let mut config = csv_config(&dir);
        config.fanout.workers = 1;
        let harvester = harvester(&browser, config);
        harvester.login().await.unwrap();
        browser.reject_logins();
        let refs = ReferenceData {
            service_group_ids: vec![ReferenceId(1)],
            technique_ids: (10..14).map(ReferenceId).collect(),
            ..Default::default()
        };

        let err = harvester
            .run_with_references(&[Job::UncertaintyBudgets], &refs)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Authentication { .. }), "got {err:?}");
        assert_eq!(browser.logins(), 2);
        assert!(browser.is_closed());
        assert_eq!(browser.opens(), 1, "no lookup after the failed re-login");
    }

    #[tokio::test]
    async fn test_components_use_budget_ids_stored_in_database() {
        let browser = Arc::new(ScriptedBrowser::new());
        scripted_references(&browser);
        browser.serve(
            &format!("{}&serviceGroupId=1&techniqueId=10", BUDGETS),
            r#"{"Data": [{"UncertaintyBudgetId": 7, "Name": "Length"}, {"UncertaintyBudgetId": 8, "Name": "Angle"}]}"#,
        );
        browser.serve(
            "/UncertaintyComponent/List?UncertaintyBudgetId=7",
            r#"{"uncertaintyComponents": [{"Name": "Repeatability", "Value": "0.1 um"}]}"#,
        );
        browser.serve(
            "/UncertaintyComponent/List?UncertaintyBudgetId=8",
            r#"{"success": true}"#,
        );
        let dir = TempDir::new().unwrap();
        let mut config = test_config();
        config.output.target = OutputTarget::Database;
        config.output.database_path = dir.path().join("qualer.db");
        let harvester = harvester(&browser, config);

        let summary = harvester
            .run(&[Job::UncertaintyBudgets, Job::UncertaintyComponents])
            .await
            .unwrap();

        assert!(summary.is_complete(), "failed: {:?}", summary.reports);
        let components = &summary.reports[1];
        assert_eq!(components.job, "uncertainty_components");
        assert_eq!(components.total, 2);
        assert_eq!(components.rows_written, 1);

        let db = Database::new(&dir.path().join("qualer.db")).await.unwrap();
        let rows = db.select_rows("uncertainty_components").await.unwrap();
        assert_eq!(
            serde_json::Value::Array(rows.into_iter().map(serde_json::Value::Object).collect()),
            json!([{"Name": "Repeatability", "Value": "0.1 um", "UncertaintyBudgetId": 7}])
        );
    }

    #[tokio::test]
    async fn test_components_use_budget_ids_from_csv() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.serve(
            "/UncertaintyComponent/List?UncertaintyBudgetId=7",
            r#"{"uncertaintyComponents": [{"Name": "Resolution"}]}"#,
        );
        browser.serve(
            "/UncertaintyComponent/List?UncertaintyBudgetId=8",
            r#"{"uncertaintyComponents": [{"Name": "Drift", "UncertaintyBudgetId": 99}]}"#,
        );
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("AllUncertaintyBudgets.csv"),
            "UncertaintyBudgetId,ServiceGroupId\n7,1\n8,1\n7,2\n",
        )
        .unwrap();
        let mut config = csv_config(&dir);
        config.fanout.workers = 1;
        let harvester = harvester(&browser, config);

        let summary = harvester
            .run_with_references(&[Job::UncertaintyComponents], &ReferenceData::default())
            .await
            .unwrap();

        assert_eq!(summary.reports[0].total, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("CompleteUncertaintyBudgets.csv")).unwrap(),
            "Name,UncertaintyBudgetId\nResolution,7\nDrift,8\n"
        );
    }

    #[tokio::test]
    async fn test_components_without_stored_budgets_is_empty_batch() {
        let browser = Arc::new(ScriptedBrowser::new());
        let dir = TempDir::new().unwrap();
        let harvester = harvester(&browser, csv_config(&dir));

        let summary = harvester
            .run_with_references(&[Job::UncertaintyComponents], &ReferenceData::default())
            .await
            .unwrap();

        assert_eq!(summary.reports[0].total, 0);
        assert_eq!(browser.opens(), 0);

        let refs = ReferenceData {
            uncertainty_budget_ids: Some(vec![ReferenceId(9)]),
            ..Default::default()
        };
        assert_eq!(
            harvester.pairs_for(Job::UncertaintyComponents, &refs),
            vec![TaskPair::new(ReferenceId(9), ReferenceId(9))]
        );
    }

    #[tokio::test]
    async fn test_reference_ids_are_deduplicated() {
        let browser = Arc::new(ScriptedBrowser::new());
        browser.serve(
            "/ServiceType/ServiceCapabilities",
            r#"{"views": [{"ServiceGroupId": 2}, {"ServiceGroupId": 1}, {"ServiceGroupId": 2}]}"#,
        );
        browser.serve("/ServiceGroupTechnique/TechniquesList", "[]");
        let harvester = harvester(&browser, test_config());
        let mut events = harvester.subscribe();

        let refs = harvester.collect_reference_data().await.unwrap();

        assert_eq!(refs.service_groups.len(), 3);
        assert_eq!(refs.service_group_ids, vec![ReferenceId(2), ReferenceId(1)]);
        assert!(refs.technique_ids.is_empty());
        assert_eq!(refs.certification_ids, vec![ReferenceId(284)]);
        assert!(harvester.pairs_for(Job::UncertaintyBudgets, &refs).is_empty());
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ReferencesLoaded {
                service_groups: 3,
                techniques: 0
            }
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let browser = Arc::new(ScriptedBrowser::new());
        let mut config = test_config();
        config.fanout.workers = 0;

        let result = Harvester::new(
            config,
            browser,
            Credential::new("user@example.com", "hunter2"),
        );

        assert!(matches!(result, Err(Error::Config { .. })));
    }
}
