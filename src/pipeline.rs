// src/pipeline.rs
//
// One bill file end to end: normalize, clean, regex, cache, two-pass LLM,
// then persist the payload and reconcile it into the project's records.

use crate::cache::CacheService;
use crate::clean::{CleanedText, TextCleaner};
use crate::config::Config;
use crate::error::{JobError, NormalizeError};
use crate::jobs::{JobQueue, JobReporter, JobState};
use crate::llm::CompletionClient;
use crate::metrics::ProcessingMetrics;
use crate::model::{ErrorCode, ExtractionResult, PassUsed};
use crate::normalize::{NormalizedDocument, Normalizer};
use crate::patterns::PatternExtractor;
use crate::reconcile;
use crate::resolve::resolve;
use crate::store::{Store, files};
use crate::two_pass::TwoPassExtractor;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{Instrument, debug, info, info_span, warn};

/// Final extraction plus the metrics recorded for it.
#[derive(Debug, Clone)]
pub struct PipelineOutput {
    pub result: ExtractionResult,
    pub metrics: ProcessingMetrics,
}

impl PipelineOutput {
    pub fn pass_used(&self) -> Option<PassUsed> {
        self.metrics.pass_used
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn failure(code: ErrorCode, reason: impl Into<String>, started: Instant) -> PipelineOutput {
    let reason = reason.into();
    warn!(code = code.as_str(), %reason, "extraction failed");
    PipelineOutput {
        result: ExtractionResult::soft_failure(code, reason),
        metrics: ProcessingMetrics::new("none", elapsed_ms(started)),
    }
}

pub struct Pipeline {
    normalizer: Arc<Normalizer>,
    cleaner: TextCleaner,
    patterns: PatternExtractor,
    cache: CacheService,
    two_pass: Option<TwoPassExtractor>,
    store: Arc<Store>,
    native_min_chars: usize,
}

impl Pipeline {
    /// Without a `client`, bills the regex pass cannot answer end as
    /// parsing failures.
    pub fn new(config: &Config, store: Arc<Store>, client: Option<Arc<dyn CompletionClient>>) -> Self {
        Self {
            normalizer: Arc::new(Normalizer::new(config.normalizer.clone())),
            cleaner: TextCleaner::new(config.cleaner.clone()),
            patterns: PatternExtractor::new(config.extraction.electric_success_threshold),
            cache: CacheService::new(store.clone()),
            two_pass: client.map(|c| TwoPassExtractor::new(c, config.llm.clone())),
            store,
            native_min_chars: config.extraction.native_min_chars,
        }
    }

    /// Queue `file_id` on `queue`.
    pub fn submit(self: &Arc<Self>, queue: &JobQueue, file_id: i64) -> Result<(), JobError> {
        let pipeline = Arc::clone(self);
        queue.submit(
            file_id,
            move |reporter| async move { pipeline.process_file(file_id, &reporter).await },
            move |status| info!(file_id, state = ?status.state, "Bill job finished"),
        )
    }

    /// Job body: extract, save the payload, reconcile. The `Ok` value is the
    /// job's result summary.
    pub async fn process_file(&self, file_id: i64, reporter: &JobReporter) -> Result<Value, String> {
        let file = self
            .store
            .with_conn(|conn| files::get_file(conn, file_id))
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("no bill file with id {file_id}"))?;

        let span = info_span!("bill", file_id, filename = %file.filename);
        async {
            self.store
                .with_conn(|conn| files::set_processing_status(conn, file_id, "processing"))
                .map_err(|e| e.to_string())?;

            let out = self.extract(file_id, Path::new(&file.file_path), reporter).await;
            self.store
                .with_conn(|conn| files::save_extraction(conn, file_id, &out.result, Some(&out.metrics)))
                .map_err(|e| e.to_string())?;

            if let Some(code) = out.result.error_code {
                let reason = out.result.error_reason.as_deref().unwrap_or_default();
                return Err(format!("{}: {reason}", code.as_str()));
            }

            let outcome = match reconcile::reconcile_file(&self.store, &file.project_id, file_id, &out.result) {
                Ok(outcome) => outcome,
                Err(e) => {
                    if let Err(status_err) = self
                        .store
                        .with_conn(|conn| files::set_processing_status(conn, file_id, "failed"))
                    {
                        warn!(error = %status_err, "could not mark file failed");
                    }
                    return Err(e.to_string());
                }
            };
            self.store
                .with_conn(|conn| files::set_processing_status(conn, file_id, "reconciled"))
                .map_err(|e| e.to_string())?;

            Ok::<Value, String>(json!({
                "file_id": file_id,
                "success": out.result.success,
                "service_type": out.result.service_type.as_str(),
                "pass_used": out.pass_used().map(PassUsed::as_str),
                "review_status": outcome.review_status.as_str(),
                "missing_fields": outcome.missing_fields,
                "bills": outcome.bill_ids.len(),
            }))
        }
        .instrument(span)
        .await
    }

    /// Run extraction on a file without touching the bill-file row.
    pub async fn extract(&self, file_id: i64, path: &Path, reporter: &JobReporter) -> PipelineOutput {
        let started = Instant::now();
        reporter.set_state(JobState::ExtractingText, "Reading embedded text");

        match self.normalize(path, true).await {
            Ok(Ok(doc)) if doc.char_count > self.native_min_chars => {
                let cleaned = self.cleaner.clean(&doc.text);
                let regex = self.patterns.extract(&cleaned.text);
                if regex.success {
                    info!(chars = doc.char_count, "native text answered extraction");
                    return self.regex_only(regex, &doc, &cleaned, PassUsed::NativeRegexOnly, started);
                }
                debug!("native regex pass incomplete, continuing");
            }
            Ok(Ok(doc)) => debug!(chars = doc.char_count, "native text too thin"),
            Ok(Err(e)) => debug!(error = %e, "native read failed"),
            Err(e) => warn!(error = %e, "native read task failed"),
        }

        reporter.set_state(JobState::Ocr, "Extracting text");
        let doc = match self.normalize(path, false).await {
            Ok(Ok(doc)) => doc,
            Ok(Err(e)) => return failure(ErrorCode::NormalizationFailed, e.to_string(), started),
            Err(e) => return failure(ErrorCode::ExtractionException, e.to_string(), started),
        };
        self.analyze(file_id, doc, reporter, started).await
    }

    /// Steps after normalization: clean, regex, cache, two-pass.
    pub async fn analyze(
        &self,
        file_id: i64,
        doc: NormalizedDocument,
        reporter: &JobReporter,
        started: Instant,
    ) -> PipelineOutput {
        reporter.set_state(JobState::Cleaning, "Cleaning text");
        let cleaned = self.cleaner.clean(&doc.text);
        let regex = self.patterns.extract(&cleaned.text);

        if !regex.service_type.is_electric() {
            info!(service_type = regex.service_type.as_str(), "non-electric bill, skipping LLM");
            return self.regex_only(regex, &doc, &cleaned, PassUsed::RegexOnly, started);
        }
        if regex.success {
            return self.regex_only(regex, &doc, &cleaned, PassUsed::OcrRegexOnly, started);
        }

        let (hash, hit) = self.cache.check_and_get(&cleaned.text);
        if let Some(cached) = hit {
            reporter.set_state(JobState::CachedHit, "Using cached extraction");
            let metrics = self.metrics(&doc, &cleaned, started).with_pass(PassUsed::Cached);
            let result = resolve(&regex, None, Some(&cached), &doc.text);
            return PipelineOutput { result, metrics };
        }

        let Some(two_pass) = &self.two_pass else {
            return failure(ErrorCode::ParsingFailed, "no LLM client configured", started);
        };
        reporter.set_state(JobState::ParsingPassA, "Running Pass A");
        let outcome = two_pass
            .extract_reporting(&cleaned.text, &cleaned.evidence_lines, || {
                reporter.set_state(JobState::ParsingPassB, "Running Pass B")
            })
            .await;

        let metrics = self
            .metrics(&doc, &cleaned, started)
            .with_tokens(outcome.tokens_in, outcome.tokens_out)
            .with_pass(outcome.pass_used);

        match outcome.data {
            Some(ai) => {
                if let Some(e) = &outcome.error {
                    warn!(error = %e, "LLM extraction degraded");
                }
                self.cache.put(file_id, &hash, &cleaned.text, &ai, &metrics);
                let result = resolve(&regex, Some(&ai), None, &doc.text);
                PipelineOutput { result, metrics }
            }
            None => {
                let reason = outcome
                    .error
                    .unwrap_or_else(|| "LLM extraction failed".to_string());
                warn!(%reason, "LLM extraction failed");
                let mut result = ExtractionResult::soft_failure(ErrorCode::ParsingFailed, reason);
                result.service_type = regex.service_type;
                result.raw_text = Some(doc.text);
                PipelineOutput { result, metrics }
            }
        }
    }

    async fn normalize(
        &self,
        path: &Path,
        native_only: bool,
    ) -> Result<Result<NormalizedDocument, NormalizeError>, JoinError> {
        let normalizer = Arc::clone(&self.normalizer);
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            if native_only {
                normalizer.normalize_native_only(&path)
            } else {
                normalizer.normalize(&path)
            }
        })
        .await
    }

    fn metrics(&self, doc: &NormalizedDocument, cleaned: &CleanedText, started: Instant) -> ProcessingMetrics {
        ProcessingMetrics::new(doc.method.as_str(), elapsed_ms(started))
            .with_document(doc.page_count, cleaned.text.chars().count())
    }

    fn regex_only(
        &self,
        mut regex: ExtractionResult,
        doc: &NormalizedDocument,
        cleaned: &CleanedText,
        pass: PassUsed,
        started: Instant,
    ) -> PipelineOutput {
        regex.raw_text = Some(doc.text.clone());
        let metrics = self.metrics(doc, cleaned, started).with_pass(pass);
        info!(pass = pass.as_str(), success = regex.success, "regex pass finished");
        PipelineOutput { result: regex, metrics }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobRegistry;
    use crate::llm::testing::ScriptedClient;
    use crate::model::{ExtractionMethod, ServiceType};
    use crate::normalize::NormalizeMethod;

    const SCE_BILL: &str = "Southern California Edison\n\
        Customer account\n700203608397\n\
        Service account\n8001053647\n\
        SERVICE ADDRESS: 1151 OLYMPIC DR, CORONA CA 92881\n\
        RATE SCHEDULE TOU-8-D\n\
        For meter V349N-002081 from 07/21/25 to 08/18/25\n\
        Total electricity you used this month in kWh 160,474\n\
        Amount due $37,225.88\n\
        Due by 09/08/25\n";

    const WATER_BILL: &str = "City of Riverside\nWater Charges $45.10\nGallons used 4,000\n\
        Account Number: 55512345\nAmount due $45.10";

    const THIN_BILL: &str = "Southern California Edison\nAccount Number: 12345678\n\
        Thank you for your payment.";

    const LLM_REPLY: &str = r#"{"utility_name":"Southern California Edison","account_number":"8001053647",
        "meter_number":"V349N-002081","billing_period":{"start":"2025-07-21","end":"2025-08-18"},
        "total_kwh":160474,"total_charges":37225.88,"amount_due":null,"confidence":0.9}"#;

    fn doc(text: &str) -> NormalizedDocument {
        NormalizedDocument {
            text: text.to_string(),
            method: NormalizeMethod::PdfOcr,
            page_count: 1,
            char_count: text.chars().count(),
            confidence: 0.85,
        }
    }

    fn reporter() -> JobReporter {
        JobReporter::new(1, Arc::new(JobRegistry::new()))
    }

    fn pipeline(client: Option<Arc<ScriptedClient>>) -> Pipeline {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let client = client.map(|c| c as Arc<dyn CompletionClient>);
        Pipeline::new(&Config::default(), store, client)
    }

    #[tokio::test]
    async fn test_regex_success_never_calls_llm() {
        let client = Arc::new(ScriptedClient::new().reply(LLM_REPLY));
        let p = pipeline(Some(client.clone()));
        let out = p.analyze(1, doc(SCE_BILL), &reporter(), Instant::now()).await;

        assert_eq!(client.calls(), 0);
        assert!(out.result.success);
        assert_eq!(out.pass_used(), Some(PassUsed::OcrRegexOnly));
        assert_eq!(out.result.raw_text.as_deref(), Some(SCE_BILL));
        assert_eq!(out.metrics.method, "pdf_ocr");
    }

    #[tokio::test]
    async fn test_water_bill_short_circuits() {
        let client = Arc::new(ScriptedClient::new().reply(LLM_REPLY));
        let p = pipeline(Some(client.clone()));
        let out = p.analyze(1, doc(WATER_BILL), &reporter(), Instant::now()).await;

        assert_eq!(client.calls(), 0);
        assert_eq!(out.result.service_type, ServiceType::Water);
        assert_eq!(out.pass_used(), Some(PassUsed::RegexOnly));
    }

    #[tokio::test]
    async fn test_llm_result_is_cached() {
        let client = Arc::new(ScriptedClient::new().reply(LLM_REPLY));
        let p = pipeline(Some(client.clone()));

        let first = p.analyze(1, doc(THIN_BILL), &reporter(), Instant::now()).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(first.pass_used(), Some(PassUsed::PassA));
        assert_eq!(first.result.method, ExtractionMethod::AiPassA);
        assert_eq!(first.result.account_number.as_deref(), Some("8001053647"));
        assert!(first.result.success);
        assert_eq!((first.metrics.tokens_in, first.metrics.tokens_out), (100, 20));

        let second = p.analyze(2, doc(THIN_BILL), &reporter(), Instant::now()).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(second.pass_used(), Some(PassUsed::Cached));
        assert!(second.metrics.cache_hit);
        assert_eq!(second.result.method, ExtractionMethod::Cached);
        assert_eq!(second.result.raw_text.as_deref(), Some(THIN_BILL));
        assert_eq!(second.result.total_kwh, Some(160474.0));
    }

    #[tokio::test]
    async fn test_llm_failure_is_soft_failure() {
        let client = Arc::new(ScriptedClient::new());
        let p = pipeline(Some(client.clone()));
        let out = p.analyze(1, doc(THIN_BILL), &reporter(), Instant::now()).await;
        assert_eq!(client.calls(), 1);
        assert_eq!(out.result.error_code, Some(ErrorCode::ParsingFailed));
        assert!(!out.result.success);

        let out = pipeline(None).analyze(1, doc(THIN_BILL), &reporter(), Instant::now()).await;
        assert_eq!(out.result.error_code, Some(ErrorCode::ParsingFailed));
    }

    #[tokio::test]
    async fn test_unsupported_file_fails_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.docx");
        std::fs::write(&path, b"not a bill").unwrap();

        let out = pipeline(None).extract(1, &path, &reporter()).await;
        assert_eq!(out.result.error_code, Some(ErrorCode::NormalizationFailed));
        assert!(out.result.error_reason.unwrap().contains(".docx"));
    }

    #[tokio::test]
    async fn test_process_file_records_failure_on_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bill.docx");
        std::fs::write(&path, b"not a bill").unwrap();

        let p = pipeline(None);
        let file_id = p
            .store
            .with_conn(|conn| files::register_file(conn, "proj", "bill.docx", &path.to_string_lossy(), 10))
            .unwrap();

        let err = p.process_file(file_id, &reporter()).await.unwrap_err();
        assert!(err.starts_with("NORMALIZATION_FAILED"));

        let row = p.store.with_conn(|conn| files::get_file(conn, file_id)).unwrap().unwrap();
        assert_eq!(row.processing_status, "failed");
        assert_eq!(
            row.payload().unwrap().unwrap().error_code,
            Some(ErrorCode::NormalizationFailed)
        );

        assert!(p.process_file(404, &reporter()).await.is_err());
    }
}
