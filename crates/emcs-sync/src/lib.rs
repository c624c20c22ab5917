//! Enrichment pipeline orchestration: fetch, aggregate, merge, report.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use emcs_adapters::{
    normalize_responses, read_survey, ColumnMapping, SchemaError, SurveyReadError,
};
use emcs_core::{
    AssetFacts, AssetRecord, AssetTypeCount, ClaimFacts, ClaimRecord, FactCategory,
    IdentityBatch, ProfileSummary, SurveyResponse,
};
use emcs_storage::{
    BackoffPolicy, CacheLoadError, CacheMergeError, CachePersistError, CacheStats,
    FixtureIdentityResolver, HttpClientConfig, HttpIdentityResolver, IdentityCache,
    IdentityResolver, ResolveError,
};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod report;

pub use report::{ReportError, ReportFormat, ReportSummary};

pub const CRATE_NAME: &str = "emcs-sync";

pub const JOB_TITLE_LABEL: &str = "job title";
pub const ORGANIZATION_AFFILIATION_LABEL: &str = "organization affiliation";
pub const COAUTHOR_LABEL: &str = "coauthor";
pub const EXPERTISE_LABEL: &str = "expertise";
pub const KEYWORD_LABEL: &str = "keyword";

#[derive(Debug, Clone)]
pub enum ResolverSource {
    Http { base_url: String },
    Fixture { path: PathBuf },
}

#[derive(Debug, Clone)]
pub struct EnrichConfig {
    pub survey_path: PathBuf,
    pub cache_path: PathBuf,
    pub output_path: PathBuf,
    pub report_format: ReportFormat,
    pub schema_path: Option<PathBuf>,
    pub resolver: ResolverSource,
    pub http: HttpClientConfig,
}

impl EnrichConfig {
    pub fn default_output_path(today: NaiveDate, format: ReportFormat) -> PathBuf {
        PathBuf::from(format!(
            "augmented_survey_data_{}.{}",
            today.format("%Y%m%d"),
            format.extension()
        ))
    }

    pub fn default_output_path_today(format: ReportFormat) -> PathBuf {
        Self::default_output_path(Local::now().date_naive(), format)
    }

    /// Resolver HTTP settings from `EMCS_RESOLVER_TIMEOUT_SECS`,
    /// `EMCS_RESOLVER_MAX_RETRIES` and `EMCS_USER_AGENT`.
    pub fn http_from_env() -> HttpClientConfig {
        let defaults = HttpClientConfig::default();
        HttpClientConfig {
            timeout: std::env::var("EMCS_RESOLVER_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            user_agent: Some(
                std::env::var("EMCS_USER_AGENT").unwrap_or_else(|_| "emcs-enrich/0.1".to_string()),
            ),
            backoff: BackoffPolicy {
                max_retries: std::env::var("EMCS_RESOLVER_MAX_RETRIES")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(defaults.backoff.max_retries),
                ..defaults.backoff
            },
        }
    }

    /// Required inputs must exist before any stage runs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !self.survey_path.exists() {
            return Err(PipelineError::Configuration(format!(
                "survey source file {} does not exist; pass it with --survey",
                self.survey_path.display()
            )));
        }
        if !self.cache_path.exists() {
            return Err(PipelineError::Configuration(format!(
                "identity cache {} does not exist; create one with `emcs-cli init-cache {}`",
                self.cache_path.display(),
                self.cache_path.display()
            )));
        }
        if let Some(schema) = &self.schema_path {
            if !schema.exists() {
                return Err(PipelineError::Configuration(format!(
                    "schema file {} does not exist",
                    schema.display()
                )));
            }
        }
        if let ResolverSource::Fixture { path } = &self.resolver {
            if !path.exists() {
                return Err(PipelineError::Configuration(format!(
                    "resolver fixture {} does not exist",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn build_resolver(&self) -> Result<Box<dyn IdentityResolver>, PipelineError> {
        let resolver: Box<dyn IdentityResolver> = match &self.resolver {
            ResolverSource::Http { base_url } => Box::new(
                HttpIdentityResolver::new(base_url, self.http.clone())
                    .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?,
            ),
            ResolverSource::Fixture { path } => Box::new(
                FixtureIdentityResolver::from_path(path)
                    .map_err(|e| PipelineError::Configuration(format!("{e:#}")))?,
            ),
        };
        Ok(resolver)
    }
}

#[derive(Debug, Error)]
pub enum EnrichmentFetchError {
    #[error("resolver `{resolver}` failed for {requested} identifiers: {source}")]
    Resolve {
        resolver: &'static str,
        requested: usize,
        #[source]
        source: ResolveError,
    },
    #[error("merging resolved identities: {0}")]
    Merge(#[from] CacheMergeError),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    SurveyRead(#[from] SurveyReadError),
    #[error(transparent)]
    CacheLoad(#[from] CacheLoadError),
    #[error(transparent)]
    EnrichmentFetch(#[from] EnrichmentFetchError),
    #[error(transparent)]
    CachePersist(#[from] CachePersistError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentOutcome {
    pub requested: usize,
    pub resolved: usize,
    /// Requested identifiers the resolver returned no directory entry for.
    pub unresolved: Vec<String>,
    /// Records outside the requested set, duplicated, or orphaned.
    pub discarded_records: usize,
}

impl EnrichmentOutcome {
    pub fn cache_changed(&self) -> bool {
        self.resolved > 0
    }
}

/// Resolves identifiers the cache has not seen and appends them to it.
pub struct EnrichmentFetcher {
    resolver: Box<dyn IdentityResolver>,
}

impl EnrichmentFetcher {
    pub fn new(resolver: Box<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }

    pub fn missing_identifiers(
        cache: &IdentityCache,
        source_identifiers: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        source_identifiers
            .iter()
            .filter(|id| !cache.contains(id))
            .cloned()
            .collect()
    }

    /// One resolver call for the uncached identifiers; none when all are cached.
    /// The cache is only touched after the call succeeds.
    pub async fn fetch(
        &self,
        cache: &mut IdentityCache,
        source_identifiers: &BTreeSet<String>,
    ) -> Result<EnrichmentOutcome, EnrichmentFetchError> {
        let missing = Self::missing_identifiers(cache, source_identifiers);
        if missing.is_empty() {
            info!(
                identifiers = source_identifiers.len(),
                "all identifiers already cached; resolver not called"
            );
            return Ok(EnrichmentOutcome::default());
        }

        info!(
            missing = missing.len(),
            resolver = self.resolver.name(),
            "resolving uncached identifiers"
        );
        let response = self
            .resolver
            .resolve(&missing, &FactCategory::ALL)
            .await
            .map_err(|source| EnrichmentFetchError::Resolve {
                resolver: self.resolver.name(),
                requested: missing.len(),
                source,
            })?;

        let (accepted, discarded_records) = retain_requested(response, &missing);
        let resolved: HashSet<&str> = accepted
            .directory
            .iter()
            .map(|d| d.identifier_email.as_str())
            .collect();
        let unresolved: Vec<String> = missing
            .iter()
            .filter(|id| !resolved.contains(id.as_str()))
            .cloned()
            .collect();
        let outcome = EnrichmentOutcome {
            requested: missing.len(),
            resolved: resolved.len(),
            unresolved,
            discarded_records,
        };

        if !outcome.unresolved.is_empty() {
            warn!(
                unresolved = outcome.unresolved.len(),
                "resolver returned no directory entry for some identifiers; they stay uncached"
            );
        }
        cache.merge(accepted)?;
        info!(
            resolved = outcome.resolved,
            stats = %cache.stats(),
            "merged resolved identities"
        );
        Ok(outcome)
    }
}

/// Keep only directory entries that were asked for (first one wins) and the
/// facts that hang off them.
fn retain_requested(batch: IdentityBatch, requested: &BTreeSet<String>) -> (IdentityBatch, usize) {
    let received = batch.directory.len() + batch.assets.len() + batch.claims.len();
    let mut accepted_ids = HashSet::new();

    let directory: Vec<_> = batch
        .directory
        .into_iter()
        .filter(|d| {
            requested.contains(&d.identifier_email)
                && accepted_ids.insert(d.identifier_email.clone())
        })
        .collect();
    let assets: Vec<_> = batch
        .assets
        .into_iter()
        .filter(|a| accepted_ids.contains(&a.identifier_email))
        .collect();
    let claims: Vec<_> = batch
        .claims
        .into_iter()
        .filter(|c| accepted_ids.contains(&c.subject_identifier_email))
        .collect();

    let kept = directory.len() + assets.len() + claims.len();
    let discarded = received - kept;
    if discarded > 0 {
        warn!(discarded, "discarded resolver records outside the requested identifiers");
    }
    (
        IdentityBatch {
            directory,
            assets,
            claims,
        },
        discarded,
    )
}

/// Summaries in directory order, addressable by identifier.
#[derive(Debug, Clone, Default)]
pub struct ProfileSet {
    summaries: Vec<ProfileSummary>,
    index: HashMap<String, usize>,
}

impl ProfileSet {
    pub fn get(&self, identifier: &str) -> Option<&ProfileSummary> {
        self.index.get(identifier).map(|&i| &self.summaries[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProfileSummary> {
        self.summaries.iter()
    }

    pub fn len(&self) -> usize {
        self.summaries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.summaries.is_empty()
    }
}

pub fn aggregate_profiles(records: &IdentityBatch) -> ProfileSet {
    let mut assets_by_id: HashMap<&str, Vec<&AssetRecord>> = HashMap::new();
    for asset in &records.assets {
        assets_by_id
            .entry(asset.identifier_email.as_str())
            .or_default()
            .push(asset);
    }
    let mut claims_by_id: HashMap<&str, Vec<&ClaimRecord>> = HashMap::new();
    for claim in &records.claims {
        claims_by_id
            .entry(claim.subject_identifier_email.as_str())
            .or_default()
            .push(claim);
    }

    let mut set = ProfileSet::default();
    for entry in &records.directory {
        let id = entry.identifier_email.as_str();
        let summary = ProfileSummary {
            identity: entry.clone(),
            assets: assets_by_id.get(id).and_then(|a| summarize_assets(a)),
            claims: claims_by_id.get(id).and_then(|c| summarize_claims(c)),
        };
        set.index.insert(id.to_string(), set.summaries.len());
        set.summaries.push(summary);
    }
    set
}

/// Most-common ranking of asset types plus the publication year span. Assets
/// without a year still count towards the ranking.
pub fn summarize_assets(assets: &[&AssetRecord]) -> Option<AssetFacts> {
    if assets.is_empty() {
        return None;
    }
    let years = || assets.iter().filter_map(|a| a.datepublished);

    let mut counts: Vec<AssetTypeCount> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    for asset in assets {
        match position.get(asset.additionaltype.as_str()) {
            Some(&i) => counts[i].1 += 1,
            None => {
                position.insert(asset.additionaltype.as_str(), counts.len());
                counts.push(AssetTypeCount(asset.additionaltype.clone(), 1));
            }
        }
    }
    // stable: equal counts stay in first-seen order
    counts.sort_by(|a, b| b.1.cmp(&a.1));

    Some(AssetFacts {
        scientific_assets_summary: counts,
        first_year_published: years().min(),
        last_year_published: years().max(),
    })
}

fn distinct_objects<'a>(claims: &[&'a ClaimRecord], label: &str) -> BTreeSet<&'a str> {
    claims
        .iter()
        .filter(|c| c.property_label == label)
        .map(|c| c.object_label.as_str())
        .collect()
}

pub fn summarize_claims(claims: &[&ClaimRecord]) -> Option<ClaimFacts> {
    if claims.is_empty() {
        return None;
    }
    let list = |label| {
        distinct_objects(claims, label)
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
    };
    Some(ClaimFacts {
        job_titles: list(JOB_TITLE_LABEL),
        organization_affiliations: list(ORGANIZATION_AFFILIATION_LABEL),
        distinct_coauthors: distinct_objects(claims, COAUTHOR_LABEL).len(),
        expertise_terms: list(EXPERTISE_LABEL),
        metadata_keywords: list(KEYWORD_LABEL),
    })
}

/// A survey response joined with its profile, if the identity is known.
#[derive(Debug, Clone, Copy)]
pub struct EnrichedRow<'a> {
    pub response: &'a SurveyResponse,
    pub profile: Option<&'a ProfileSummary>,
}

/// Left join on `email = identifier_email`, preserving response order.
pub fn merge_report<'a>(
    responses: &'a [SurveyResponse],
    profiles: &'a ProfileSet,
) -> Vec<EnrichedRow<'a>> {
    responses
        .iter()
        .map(|response| EnrichedRow {
            response,
            profile: response.email().and_then(|email| profiles.get(&email)),
        })
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub survey_rows: usize,
    pub responses: usize,
    pub duplicates_dropped: usize,
    pub source_identifiers: usize,
    pub fetch: EnrichmentOutcome,
    pub cache: CacheStats,
    pub profiles: usize,
    pub report: ReportSummary,
}

pub struct EnrichmentPipeline {
    config: EnrichConfig,
    fetcher: EnrichmentFetcher,
}

impl EnrichmentPipeline {
    pub fn new(config: EnrichConfig, resolver: Box<dyn IdentityResolver>) -> Self {
        Self {
            config,
            fetcher: EnrichmentFetcher::new(resolver),
        }
    }

    pub fn from_config(config: EnrichConfig) -> Result<Self, PipelineError> {
        config.validate()?;
        let resolver = config.build_resolver()?;
        Ok(Self::new(config, resolver))
    }

    pub async fn run_once(&self) -> Result<RunSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrich_run", %run_id);
        self.run_stages(run_id).instrument(span).await
    }

    async fn run_stages(&self, run_id: Uuid) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        self.config.validate()?;

        let mapping = match &self.config.schema_path {
            Some(path) => ColumnMapping::from_path(path)?,
            None => ColumnMapping::bundled()?,
        };
        let table = read_survey(&self.config.survey_path)?;
        let survey = normalize_responses(&table, &mapping);

        let mut cache = IdentityCache::load(&self.config.cache_path).await?;
        let fetch = self
            .fetcher
            .fetch(&mut cache, &survey.source_identifiers)
            .await?;
        if fetch.cache_changed() {
            cache.persist(&self.config.cache_path).await?;
        }

        let profiles = aggregate_profiles(cache.records());
        let rows = merge_report(&survey.responses, &profiles);
        let report =
            report::write_report(
                &self.config.output_path,
                self.config.report_format,
                &mapping.property_names,
                &rows,
            )
            .await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            survey_rows: table.rows.len(),
            responses: survey.responses.len(),
            duplicates_dropped: survey.duplicates_dropped,
            source_identifiers: survey.source_identifiers.len(),
            fetch,
            cache: cache.stats(),
            profiles: profiles.len(),
            report,
        };
        info!(
            responses = summary.responses,
            matched = summary.report.matched_rows,
            "enrichment run complete"
        );
        Ok(summary)
    }
}

pub async fn run_enrichment(config: EnrichConfig) -> Result<RunSummary, PipelineError> {
    EnrichmentPipeline::from_config(config)?.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use emcs_core::{CellValue, IdentityRecord};

    struct CountingResolver {
        records: IdentityBatch,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl IdentityResolver for CountingResolver {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn resolve(
            &self,
            _identifiers: &BTreeSet<String>,
            _categories: &[FactCategory],
        ) -> Result<IdentityBatch, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.records.clone())
        }
    }

    fn person(email: &str) -> IdentityRecord {
        IdentityRecord {
            identifier_email: email.to_string(),
            displayname: Some(format!("Person {email}")),
            jobtitle: None,
            organization_name: None,
            organization_uri: None,
            url: None,
        }
    }

    fn asset(email: &str, kind: &str, year: i32) -> AssetRecord {
        AssetRecord {
            identifier_email: email.to_string(),
            additionaltype: kind.to_string(),
            datepublished: Some(year),
        }
    }

    fn claim(email: &str, label: &str, object: &str) -> ClaimRecord {
        ClaimRecord {
            subject_identifier_email: email.to_string(),
            property_label: label.to_string(),
            object_label: object.to_string(),
        }
    }

    fn ids(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn response(row_index: usize, email: Option<&str>) -> SurveyResponse {
        let values = vec![
            (
                "email".to_string(),
                email.map_or(CellValue::Null, |e| CellValue::Text(e.to_string())),
            ),
            ("start_time".to_string(), CellValue::Null),
        ];
        SurveyResponse { row_index, values }
    }

    #[tokio::test]
    async fn second_fetch_is_a_no_op() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = EnrichmentFetcher::new(Box::new(CountingResolver {
            records: IdentityBatch {
                directory: vec![person("a@x"), person("b@x")],
                ..Default::default()
            },
            calls: calls.clone(),
        }));
        let mut cache = IdentityCache::empty();
        let source = ids(&["a@x", "b@x"]);

        let first = fetcher.fetch(&mut cache, &source).await.expect("first fetch");
        assert_eq!(first.resolved, 2);
        let snapshot = cache.records().clone();

        let second = fetcher.fetch(&mut cache, &source).await.expect("second fetch");
        assert_eq!(second, EnrichmentOutcome::default());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.records(), &snapshot);
    }

    #[tokio::test]
    async fn fetch_only_grows_the_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut cache = IdentityCache::from_batch(IdentityBatch {
            directory: vec![person("a@x")],
            ..Default::default()
        })
        .unwrap();
        let original = cache.records().directory[0].clone();

        // The resolver also answers for an already-cached and an unrequested identity.
        let mut altered = person("a@x");
        altered.displayname = Some("Changed".into());
        let fetcher = EnrichmentFetcher::new(Box::new(CountingResolver {
            records: IdentityBatch {
                directory: vec![altered, person("b@x"), person("b@x"), person("zzz@x")],
                assets: vec![asset("b@x", "Dataset", 2020), asset("zzz@x", "Dataset", 2020)],
                claims: vec![claim("a@x", KEYWORD_LABEL, "rivers")],
            },
            calls: calls.clone(),
        }));

        let outcome = fetcher
            .fetch(&mut cache, &ids(&["a@x", "b@x", "c@x"]))
            .await
            .expect("fetch");

        assert_eq!(outcome.requested, 2);
        assert_eq!(outcome.resolved, 1);
        assert_eq!(outcome.unresolved, vec!["c@x".to_string()]);
        assert_eq!(outcome.discarded_records, 5);
        assert_eq!(cache.stats().directory, 2);
        assert_eq!(cache.records().directory[0], original);
        assert_eq!(cache.records().assets, vec![asset("b@x", "Dataset", 2020)]);
        assert!(cache.records().claims.is_empty());
    }

    #[test]
    fn asset_types_rank_by_count_then_first_seen() {
        let records = [
            asset("a@x", "B", 2015),
            asset("a@x", "A", 2003),
            asset("a@x", "A", 2019),
            asset("a@x", "C", 2010),
            asset("a@x", "B", 2011),
            asset("a@x", "A", 2012),
        ];
        let refs: Vec<&AssetRecord> = records.iter().collect();
        let facts = summarize_assets(&refs).expect("facts");
        assert_eq!(
            facts.scientific_assets_summary,
            vec![
                AssetTypeCount("A".into(), 3),
                AssetTypeCount("B".into(), 2),
                AssetTypeCount("C".into(), 1),
            ]
        );
        assert_eq!(facts.first_year_published, Some(2003));
        assert_eq!(facts.last_year_published, Some(2019));

        let tie = [asset("a@x", "Y", 2001), asset("a@x", "X", 2002)];
        let refs: Vec<&AssetRecord> = tie.iter().collect();
        let facts = summarize_assets(&refs).unwrap();
        assert_eq!(facts.scientific_assets_summary[0].0, "Y");
    }

    #[test]
    fn undated_assets_are_ranked_but_leave_the_year_span_empty() {
        let records: IdentityBatch = serde_json::from_str(
            r#"{
                "directory": [{"identifier_email": "a@x"}, {"identifier_email": "b@x"}],
                "assets": [
                    {"identifier_email": "a@x", "additionaltype": "Dataset", "datepublished": null},
                    {"identifier_email": "a@x", "additionaltype": "Dataset", "datepublished": 2012},
                    {"identifier_email": "a@x", "additionaltype": "Software"},
                    {"identifier_email": "b@x", "additionaltype": "Software", "datepublished": null}
                ]
            }"#,
        )
        .expect("decode batch");
        let profiles = aggregate_profiles(&records);

        let a = profiles.get("a@x").and_then(|p| p.assets.as_ref()).expect("a assets");
        assert_eq!(
            a.scientific_assets_summary,
            vec![AssetTypeCount("Dataset".into(), 2), AssetTypeCount("Software".into(), 1)]
        );
        assert_eq!(a.first_year_published, Some(2012));
        assert_eq!(a.last_year_published, Some(2012));

        let b = profiles.get("b@x").and_then(|p| p.assets.as_ref()).expect("b assets");
        assert_eq!(b.scientific_assets_summary, vec![AssetTypeCount("Software".into(), 1)]);
        assert_eq!(b.first_year_published, None);
        let json = serde_json::to_value(profiles.get("b@x").unwrap()).unwrap();
        assert!(json.get("scientific_assets_summary").is_some());
        assert!(json.get("first_year_published").is_none());
    }

    #[test]
    fn aggregate_fills_fact_groups_only_when_facts_exist() {
        let records = IdentityBatch {
            directory: vec![person("a@x"), person("b@x")],
            assets: vec![
                asset("a@x", "A", 2001),
                asset("a@x", "A", 2002),
                asset("a@x", "B", 2003),
            ],
            claims: vec![
                claim("a@x", COAUTHOR_LABEL, "X"),
                claim("a@x", COAUTHOR_LABEL, "X"),
                claim("a@x", COAUTHOR_LABEL, "Y"),
                claim("a@x", JOB_TITLE_LABEL, "Hydrologist"),
                claim("a@x", JOB_TITLE_LABEL, "Hydrologist"),
                claim("a@x", EXPERTISE_LABEL, "hydrology"),
                claim("a@x", "unrelated", "ignored"),
            ],
        };
        let profiles = aggregate_profiles(&records);
        assert_eq!(profiles.len(), 2);

        let a = profiles.get("a@x").expect("a");
        let assets = a.assets.as_ref().expect("asset facts");
        assert_eq!(
            assets.scientific_assets_summary,
            vec![AssetTypeCount("A".into(), 2), AssetTypeCount("B".into(), 1)]
        );
        let claims = a.claims.as_ref().expect("claim facts");
        assert_eq!(claims.distinct_coauthors, 2);
        assert_eq!(claims.job_titles, vec!["Hydrologist".to_string()]);
        assert_eq!(claims.expertise_terms, vec!["hydrology".to_string()]);
        assert!(claims.organization_affiliations.is_empty());
        assert!(claims.metadata_keywords.is_empty());

        let b = profiles.get("b@x").expect("b");
        assert!(b.assets.is_none());
        assert!(b.claims.is_none());
        let json = serde_json::to_value(b).unwrap();
        assert!(json.get("scientific_assets_summary").is_none());
        assert!(json.get("job_titles").is_none());
    }

    #[test]
    fn left_join_keeps_every_response() {
        let profiles = aggregate_profiles(&IdentityBatch {
            directory: vec![person("a@x")],
            ..Default::default()
        });
        let responses = vec![
            response(0, Some("b@x")),
            response(1, Some("a@x")),
            response(2, None),
        ];
        let rows = merge_report(&responses, &profiles);

        assert_eq!(rows.len(), 3);
        assert!(rows[0].profile.is_none());
        assert_eq!(rows[1].profile.map(|p| p.identifier()), Some("a@x"));
        assert!(rows[2].profile.is_none());
        let order: Vec<_> = rows.iter().map(|r| r.response.row_index).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn default_output_name_carries_the_date() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert_eq!(
            EnrichConfig::default_output_path(day, ReportFormat::default()),
            PathBuf::from("augmented_survey_data_20261016.xlsx")
        );
        assert_eq!(
            EnrichConfig::default_output_path(day, ReportFormat::Parquet),
            PathBuf::from("augmented_survey_data_20261016.parquet")
        );
    }
}
