//! The ingestion orchestrator: drives one source through its batch,
//! isolating per-item failures, and reduces the per-item records into a
//! run summary.

use crate::config::FetcherLimits;
use crate::error::ItemError;
use crate::report::{ParsedReport, ReportParser, ReportStore, RunLog};
use crate::source::{Source, SourceKind, SourceParams};

/// Disposition settings and the item budget for one run.
#[derive(Debug, Clone, Default)]
pub struct FetcherParams {
    pub when_done: Vec<String>,
    pub when_failed: Vec<String>,
    /// Zero means unlimited.
    pub max_messages: u32,
}

impl From<&FetcherLimits> for FetcherParams {
    fn from(limits: &FetcherLimits) -> Self {
        Self {
            when_done: limits.done.clone(),
            when_failed: limits.fail.clone(),
            max_messages: limits.max_messages,
        }
    }
}

/// Outcome of one item of the batch.
#[derive(Debug, Clone, Default)]
pub struct ItemResult {
    /// 0 on success, -1 when the item failed to load.
    pub error_code: i32,
    pub message: Option<String>,
    /// External id of the report, when parsing got that far.
    pub report_id: Option<String>,
    pub emailed_from: Option<String>,
    pub emailed_date: Option<String>,
    /// Label of the mailbox the item came from, on failures.
    pub mailbox: Option<String>,
    /// Error message of a failed disposition. Does not affect
    /// `error_code`.
    pub post_processing: Option<String>,
    /// Verbose error detail for the operator console, on failures.
    pub debug_info: Option<String>,
}

/// One record of a run: either an item outcome or a fatal source failure
/// that ended the iteration.
#[derive(Debug, Clone)]
pub enum RunRecord {
    Item(ItemResult),
    SourceError(String),
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub error_code: i32,
    pub message: Option<String>,
    pub results: Vec<ItemResult>,
    pub other_errors: Vec<String>,
}

/// Final result of a run. A run that produced exactly one record collapses
/// to that record.
#[derive(Debug, Clone)]
pub enum SummaryResult {
    Item(ItemResult),
    Summary(RunSummary),
}

pub struct ReportFetcher<'a, S: Source> {
    source: &'a mut S,
    parser: &'a dyn ReportParser,
    store: &'a mut dyn ReportStore,
    log: &'a dyn RunLog,
    params: FetcherParams,
}

impl<'a, S: Source> ReportFetcher<'a, S> {
    pub fn new(
        source: &'a mut S,
        parser: &'a dyn ReportParser,
        store: &'a mut dyn ReportStore,
        log: &'a dyn RunLog,
        params: FetcherParams,
    ) -> Self {
        Self {
            source,
            parser,
            store,
            log,
            params,
        }
    }

    /// Run the batch. Item failures are recorded and the batch continues;
    /// a source failure ends the iteration with a final error record.
    pub async fn fetch(&mut self) -> Vec<RunRecord> {
        self.source.configure(&SourceParams {
            when_done: self.params.when_done.clone(),
            when_failed: self.params.when_failed.clone(),
        });

        let mut records = Vec::new();
        if let Err(err) = self.source.rewind().await {
            records.push(RunRecord::SourceError(err.to_string()));
            return records;
        }

        let mut budget = self.params.max_messages;
        while self.source.valid() {
            let kind = self.source.kind();
            let mut result = ItemResult::default();
            let mut filename: Option<String> = None;
            let mut report: Option<ParsedReport> = None;
            let mut item_err: Option<String> = None;

            match self.source.current().await {
                Ok(file) => {
                    match self.parser.parse(&file.data, &file.filename) {
                        Ok(parsed) => {
                            if let Err(err) = self.store.save(&parsed, &file.filename) {
                                item_err = Some(format!("{err:#}"));
                                result.debug_info = Some(format!("{err:?}"));
                            }
                            report = Some(parsed);
                        }
                        Err(err) => {
                            item_err = Some(format!("{err:#}"));
                            result.debug_info = Some(format!("{err:?}"));
                        }
                    }
                    filename = Some(file.filename);
                }
                Err(ItemError::Source(err)) => {
                    records.push(RunRecord::SourceError(err.to_string()));
                    break;
                }
                Err(err) => {
                    item_err = Some(err.to_string());
                    result.debug_info = Some(format!("{err:?}"));
                }
            }

            let disposition = if item_err.is_none() {
                self.source.accepted().await
            } else {
                self.source.rejected().await
            };
            let mut err_msg = item_err.clone();
            if let Err(err) = disposition {
                let message = err.to_string();
                err_msg = Some(message.clone());
                result.post_processing = Some(message);
            }

            match &err_msg {
                None => {
                    if let Some(parsed) = &report {
                        self.log.log_success(kind, filename.as_deref(), parsed);
                    }
                }
                Some(message) => {
                    self.log.log_failure(
                        kind,
                        filename.as_deref(),
                        report.as_ref(),
                        Some(message),
                    );
                    if kind == SourceKind::Mailbox {
                        if let Some(overview) = self.source.overview().await {
                            result.emailed_from = overview.from;
                            result.emailed_date = overview.date;
                        }
                        result.mailbox = Some(self.source.label());
                    }
                    if let Some(parsed) = &report {
                        result.report_id = Some(parsed.external_id.clone());
                    }
                }
            }

            match item_err {
                Some(message) => {
                    result.error_code = -1;
                    result.message = Some(message);
                }
                None => {
                    result.message = Some("The report has been loaded successfully".to_string());
                }
            }
            records.push(RunRecord::Item(result));

            // The budget leaves the cursor parked on the last taken item;
            // anything beyond it stays untouched for the next run.
            if budget > 0 {
                budget -= 1;
                if budget == 0 {
                    break;
                }
            }
            self.source.next();
        }
        records
    }
}

/// Reduce the records of one run into the result reported to the
/// operator.
pub fn make_summary_result(records: &[RunRecord]) -> SummaryResult {
    let mut reps: Vec<ItemResult> = Vec::new();
    let mut others: Vec<String> = Vec::new();
    let mut loaded = 0usize;
    for record in records {
        match record {
            RunRecord::SourceError(message) => others.push(message.clone()),
            RunRecord::Item(item) => {
                if item.error_code == 0 {
                    loaded += 1;
                }
                if let Some(message) = &item.post_processing {
                    others.push(message.clone());
                }
                reps.push(item.clone());
            }
        }
    }

    let r_count = reps.len();
    let o_count = others.len();
    if r_count + o_count == 1 {
        if r_count == 1 {
            return SummaryResult::Item(reps.remove(0));
        }
        return SummaryResult::Summary(RunSummary {
            error_code: -1,
            message: Some(others.remove(0)),
            ..RunSummary::default()
        });
    }

    let (error_code, message) = if loaded == r_count {
        if r_count > 0 {
            (
                0,
                Some(format!(
                    "{r_count} report files have been loaded successfully"
                )),
            )
        } else if o_count == 0 {
            (0, Some("There are no report files to load".to_string()))
        } else {
            (-1, None)
        }
    } else if loaded > 0 {
        (
            -1,
            Some(format!(
                "Only {loaded} of the {r_count} report files have been loaded"
            )),
        )
    } else {
        (
            -1,
            Some(format!("None of the {r_count} report files has been loaded")),
        )
    };
    SummaryResult::Summary(RunSummary {
        error_code,
        message,
        results: reps,
        other_errors: others,
    })
}
