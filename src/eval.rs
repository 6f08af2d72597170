//! Offline evaluation against a gold question/SQL set.
//!
//! Each gold case runs through the full pipeline (with repair attempts),
//! the gold SQL goes through the same guardrails and is executed on its
//! own, and the two result tables are compared after normalization:
//!
//! - column names are lowercased; columns are matched by name when both
//!   sides have the same set of names, otherwise by position when the
//!   counts agree
//! - numbers are rounded to 2 decimals, every cell is compared as text
//! - rows are compared as a multiset unless the case sets `ordered`
//! - two 1×1 results are compared as scalars
//!
//! Gold files are JSON Lines: `{"domain", "question", "gold_sql", "ordered"?}`.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::config::Config;
use crate::error::PipelineError;
use crate::models::QueryResult;
use crate::pipeline::Services;

const ROUND_DECIMALS: i32 = 2;

#[derive(Debug, Clone, Deserialize)]
pub struct GoldCase {
    pub domain: String,
    pub question: String,
    pub gold_sql: String,
    /// Row order is part of the expected answer.
    #[serde(default)]
    pub ordered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Ok,
    Wrong,
    FailGenerateOrGuardrailPred,
    FailGuardrailGold,
    FailExecPred,
    FailExecGold,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Ok => "OK",
            CaseStatus::Wrong => "WRONG",
            CaseStatus::FailGenerateOrGuardrailPred => "FAIL_GENERATE_OR_GUARDRAIL_PRED",
            CaseStatus::FailGuardrailGold => "FAIL_GUARDRAIL_GOLD",
            CaseStatus::FailExecPred => "FAIL_EXEC_PRED",
            CaseStatus::FailExecGold => "FAIL_EXEC_GOLD",
        }
    }
}

/// One row of the report artifact.
#[derive(Debug, Clone, Serialize)]
pub struct CaseReport {
    pub domain: String,
    pub question: String,
    pub status: CaseStatus,
    pub error: String,
    pub attempts: usize,
    pub pred_sql_raw: String,
    pub pred_sql_safe: String,
    pub gold_sql_raw: String,
    pub gold_sql_safe: String,
    pub pred_cols: String,
    pub gold_cols: String,
    pub pred_rows: Option<usize>,
    pub gold_rows: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalSummary {
    pub total: usize,
    pub guardrail_pass_pred: usize,
    pub guardrail_pass_gold: usize,
    pub executed_pred: usize,
    pub executed_gold: usize,
    pub executed_both: usize,
    pub correct: usize,
}

impl EvalSummary {
    pub fn accuracy(&self) -> f64 {
        ratio(self.correct, self.total)
    }

    pub fn accuracy_on_executed(&self) -> Option<f64> {
        (self.executed_both > 0).then(|| ratio(self.correct, self.executed_both))
    }

    pub fn print(&self) {
        let pct = |n: usize| ratio(n, self.total) * 100.0;
        println!("=== EVALUATION SUMMARY ===");
        println!("Total cases:                  {}", self.total);
        println!(
            "Guardrail pass (pred):        {} ({:.2}%)",
            self.guardrail_pass_pred,
            pct(self.guardrail_pass_pred)
        );
        println!(
            "Guardrail pass (gold):        {} ({:.2}%)",
            self.guardrail_pass_gold,
            pct(self.guardrail_pass_gold)
        );
        println!(
            "Pred SQL executed:            {} ({:.2}%)",
            self.executed_pred,
            pct(self.executed_pred)
        );
        println!(
            "Gold SQL executed:            {} ({:.2}%)",
            self.executed_gold,
            pct(self.executed_gold)
        );
        println!(
            "Executed BOTH pred+gold:      {} ({:.2}%)",
            self.executed_both,
            pct(self.executed_both)
        );
        println!(
            "Execution accuracy (overall): {} ({:.2}%)",
            self.correct,
            self.accuracy() * 100.0
        );
        if let Some(acc) = self.accuracy_on_executed() {
            println!(
                "Accuracy on executed-both:    {} ({:.2}%)",
                self.correct,
                acc * 100.0
            );
        }
    }
}

fn ratio(n: usize, d: usize) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

pub fn load_gold_cases(path: &Path) -> Result<Vec<GoldCase>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read gold file: {}", path.display()))?;
    parse_gold_cases(&content)
}

pub fn parse_gold_cases(content: &str) -> Result<Vec<GoldCase>> {
    let mut cases = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let case: GoldCase = serde_json::from_str(line)
            .with_context(|| format!("Invalid gold case on line {}", i + 1))?;
        cases.push(case);
    }
    if cases.is_empty() {
        bail!("Gold file contains no cases");
    }
    Ok(cases)
}

// ============ Result comparison ============

fn normalize_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Number(n) => match n.as_f64() {
            Some(f) => format_rounded(f),
            None => n.to_string(),
        },
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

fn format_rounded(f: f64) -> String {
    let factor = 10f64.powi(ROUND_DECIMALS);
    let rounded = (f * factor).round() / factor;
    // Avoid "-0.00".
    let rounded = if rounded == 0.0 { 0.0 } else { rounded };
    format!("{:.*}", ROUND_DECIMALS as usize, rounded)
}

fn scalars_match(a: &Value, b: &Value) -> bool {
    let as_f64 = |v: &Value| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => format_rounded(x) == format_rounded(y),
        _ => normalize_cell(a) == normalize_cell(b),
    }
}

/// For each gold column, the index of the matching predicted column.
fn align_columns(pred: &[String], gold: &[String]) -> Option<Vec<usize>> {
    let lower = |cols: &[String]| -> Vec<String> { cols.iter().map(|c| c.to_lowercase()).collect() };
    let p = lower(pred);
    let g = lower(gold);

    let mut ps = p.clone();
    let mut gs = g.clone();
    ps.sort();
    gs.sort();
    let unique = ps.windows(2).all(|w| w[0] != w[1]);

    if ps == gs && unique {
        return g
            .iter()
            .map(|name| p.iter().position(|c| c == name))
            .collect();
    }
    if p.len() == g.len() {
        return Some((0..g.len()).collect());
    }
    None
}

/// Whether two result tables hold the same answer.
pub fn results_match(pred: &QueryResult, gold: &QueryResult, ordered: bool) -> bool {
    if let (Some(a), Some(b)) = (pred.scalar(), gold.scalar()) {
        return scalars_match(a, b);
    }

    let Some(mapping) = align_columns(&pred.columns, &gold.columns) else {
        return false;
    };
    if pred.rows.len() != gold.rows.len() {
        return false;
    }

    let mut p: Vec<Vec<String>> = pred
        .rows
        .iter()
        .map(|row| {
            mapping
                .iter()
                .map(|&i| row.get(i).map(normalize_cell).unwrap_or_default())
                .collect()
        })
        .collect();
    let mut g: Vec<Vec<String>> = gold
        .rows
        .iter()
        .map(|row| row.iter().map(normalize_cell).collect())
        .collect();

    if !ordered {
        p.sort();
        g.sort();
    }
    p == g
}

// ============ Harness ============

/// Whether the last candidate of a failed run got past the guardrails.
fn pred_passed_guardrails(err: &PipelineError) -> bool {
    match err {
        PipelineError::RetriesExhausted { last_error, .. } => pred_passed_guardrails(last_error),
        PipelineError::Execution { .. }
        | PipelineError::Suspicious { .. }
        | PipelineError::Connectivity { .. } => true,
        _ => false,
    }
}

fn join_cols(result: &QueryResult) -> String {
    result.columns.join("|")
}

/// Evaluate one gold case.
pub async fn evaluate_case(
    services: &Services,
    case: &GoldCase,
    summary: &mut EvalSummary,
) -> CaseReport {
    summary.total += 1;
    let mut report = CaseReport {
        domain: case.domain.clone(),
        question: case.question.clone(),
        status: CaseStatus::Wrong,
        error: String::new(),
        attempts: 0,
        pred_sql_raw: String::new(),
        pred_sql_safe: String::new(),
        gold_sql_raw: case.gold_sql.clone(),
        gold_sql_safe: String::new(),
        pred_cols: String::new(),
        gold_cols: String::new(),
        pred_rows: None,
        gold_rows: None,
    };

    // Predicted side: full pipeline.
    let pred = services.ask(&case.domain, &case.question, None).await;
    let pred_result = match pred {
        Ok(answer) => {
            summary.guardrail_pass_pred += 1;
            summary.executed_pred += 1;
            let outcome = answer.outcome;
            report.attempts = outcome.attempts.len();
            report.pred_sql_raw = outcome
                .attempts
                .last()
                .map(|a| a.raw_sql.clone())
                .unwrap_or_default();
            report.pred_sql_safe = outcome.sql;
            report.pred_cols = join_cols(&outcome.result);
            report.pred_rows = Some(outcome.result.row_count());
            Ok(outcome.result)
        }
        Err(err) => {
            let passed = pred_passed_guardrails(&err);
            if passed {
                summary.guardrail_pass_pred += 1;
            }
            if let PipelineError::RetriesExhausted { attempts, .. } = &err {
                report.attempts = *attempts as usize;
            }
            report.pred_sql_raw = err.sql().unwrap_or_default().to_string();
            if passed {
                report.pred_sql_safe = report.pred_sql_raw.clone();
            }
            let status = if passed {
                CaseStatus::FailExecPred
            } else {
                CaseStatus::FailGenerateOrGuardrailPred
            };
            Err((status, err.to_string()))
        }
    };

    // Gold side: same guardrails, executed independently.
    let gold_result = match services.guardrails.validate(&case.gold_sql) {
        Ok(safe) => {
            summary.guardrail_pass_gold += 1;
            report.gold_sql_safe = safe.clone();
            match services.executor.execute(&case.domain, &safe).await {
                Ok(result) => {
                    summary.executed_gold += 1;
                    report.gold_cols = join_cols(&result);
                    report.gold_rows = Some(result.row_count());
                    Ok(result)
                }
                Err(e) => Err((CaseStatus::FailExecGold, e.to_string())),
            }
        }
        Err(v) => Err((CaseStatus::FailGuardrailGold, v.to_string())),
    };

    // Status precedence follows the pipeline order.
    let (status, error) = match (&pred_result, &gold_result) {
        (Err((s @ CaseStatus::FailGenerateOrGuardrailPred, e)), _) => (*s, e.clone()),
        (_, Err((s @ CaseStatus::FailGuardrailGold, e))) => (*s, e.clone()),
        (Err((s, e)), _) => (*s, e.clone()),
        (_, Err((s, e))) => (*s, e.clone()),
        (Ok(p), Ok(g)) => {
            summary.executed_both += 1;
            if results_match(p, g, case.ordered) {
                summary.correct += 1;
                (CaseStatus::Ok, String::new())
            } else {
                (CaseStatus::Wrong, String::new())
            }
        }
    };
    if !matches!(status, CaseStatus::Ok | CaseStatus::Wrong) {
        tracing::debug!(question = %case.question, status = status.as_str(), "case failed: {}", error);
    }

    report.status = status;
    report.error = error;
    report
}

/// Evaluate every case in order.
pub async fn evaluate(services: &Services, cases: &[GoldCase]) -> (Vec<CaseReport>, EvalSummary) {
    let mut summary = EvalSummary::default();
    let mut reports = Vec::with_capacity(cases.len());
    for (i, case) in cases.iter().enumerate() {
        let report = evaluate_case(services, case, &mut summary).await;
        println!(
            "[{}/{}] {:<32} {} / {}",
            i + 1,
            cases.len(),
            report.status.as_str(),
            case.domain,
            case.question
        );
        reports.push(report);
    }
    (reports, summary)
}

pub fn write_report(path: &Path, reports: &[CaseReport]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create report: {}", path.display()))?;
    for r in reports {
        writer.serialize(r)?;
    }
    writer.flush()?;
    Ok(())
}

/// `nlsql eval`.
pub async fn run_eval(config: &Config, gold: &Path, report_path: &Path) -> Result<EvalSummary> {
    let cases = load_gold_cases(gold)?;
    let services = Services::from_config(config).await?;

    let (reports, summary) = evaluate(&services, &cases).await;
    println!();
    summary.print();

    write_report(report_path, &reports)?;
    println!("Saved detailed report: {}", report_path.display());
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(columns: &[&str], rows: Vec<Vec<Value>>) -> QueryResult {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            truncated: false,
        }
    }

    #[test]
    fn test_identical_results_pass() {
        let a = table(&["name", "total"], vec![vec![json!("AC/DC"), json!(10)], vec![json!("Accept"), json!(4)]]);
        assert!(results_match(&a, &a.clone(), false));
        assert!(results_match(&a, &a.clone(), true));
    }

    #[test]
    fn test_row_order_ignored_unless_ordered() {
        let a = table(&["n"], vec![vec![json!(1)], vec![json!(2)]]);
        let b = table(&["n"], vec![vec![json!(2)], vec![json!(1)]]);
        assert!(results_match(&a, &b, false));
        assert!(!results_match(&a, &b, true));
    }

    #[test]
    fn test_missing_or_extra_row_fails() {
        let a = table(&["n"], vec![vec![json!(1)], vec![json!(2)]]);
        let b = table(&["n"], vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]]);
        assert!(!results_match(&a, &b, false));
        assert!(!results_match(&b, &a, false));
    }

    #[test]
    fn test_duplicate_rows_count() {
        let a = table(&["n"], vec![vec![json!(1)], vec![json!(1)], vec![json!(2)]]);
        let b = table(&["n"], vec![vec![json!(1)], vec![json!(2)], vec![json!(2)]]);
        assert!(!results_match(&a, &b, false));
    }

    #[test]
    fn test_cell_mismatch_fails() {
        let a = table(&["a", "b"], vec![vec![json!("x"), json!(1)]; 2]);
        let b = table(&["a", "b"], vec![vec![json!("x"), json!(1)], vec![json!("x"), json!(2)]]);
        assert!(!results_match(&a, &b, false));
    }

    #[test]
    fn test_columns_matched_by_name_case_insensitive() {
        let a = table(&["Total", "Name"], vec![vec![json!(3.999), json!("Rock")], vec![json!(1), json!("Jazz")]]);
        let b = table(&["name", "total"], vec![vec![json!("Jazz"), json!(1.0)], vec![json!("Rock"), json!(4)]]);
        assert!(results_match(&a, &b, false));
    }

    #[test]
    fn test_positional_when_aliases_differ() {
        let a = table(&["artist", "cnt"], vec![vec![json!("Queen"), json!(2)]; 2]);
        let b = table(&["name", "album_count"], vec![vec![json!("Queen"), json!(2)]; 2]);
        assert!(results_match(&a, &b, false));
        let c = table(&["name"], vec![vec![json!("Queen")]; 2]);
        assert!(!results_match(&a, &c, false));
    }

    #[test]
    fn test_scalar_compare_rounds() {
        let a = table(&["sum"], vec![vec![json!(2328.6)]]);
        let b = table(&["total_revenue"], vec![vec![json!("2328.600001")]]);
        assert!(results_match(&a, &b, false));
        let c = table(&["total_revenue"], vec![vec![json!(2328.61)]]);
        assert!(!results_match(&a, &c, false));
    }

    #[test]
    fn test_null_and_negative_zero() {
        assert_eq!(normalize_cell(&Value::Null), "");
        assert_eq!(normalize_cell(&json!(-0.001)), "0.00");
        assert_eq!(normalize_cell(&json!(1.005e3)), "1005.00");
    }

    #[test]
    fn test_parse_gold_cases() {
        let text = r#"
{"domain": "chinook", "question": "How many artists?", "gold_sql": "SELECT COUNT(*) FROM artist LIMIT 1"}

{"domain": "northwind", "question": "Top 3 products", "gold_sql": "SELECT 1 LIMIT 3", "ordered": true}
"#;
        let cases = parse_gold_cases(text).unwrap();
        assert_eq!(cases.len(), 2);
        assert!(!cases[0].ordered);
        assert!(cases[1].ordered);

        let err = parse_gold_cases("{\"domain\": \"x\"}\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
        assert!(parse_gold_cases("\n\n").is_err());
    }

    #[test]
    fn test_summary_ratios() {
        let s = EvalSummary {
            total: 4,
            executed_both: 2,
            correct: 1,
            ..Default::default()
        };
        assert!((s.accuracy() - 0.25).abs() < 1e-9);
        assert_eq!(s.accuracy_on_executed(), Some(0.5));
        assert_eq!(EvalSummary::default().accuracy_on_executed(), None);
    }

    #[test]
    fn test_report_csv_columns() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        let report = CaseReport {
            domain: "chinook".into(),
            question: "How many artists, roughly?".into(),
            status: CaseStatus::FailExecGold,
            error: "relation \"artists\" does not exist".into(),
            attempts: 1,
            pred_sql_raw: "SELECT COUNT(*) FROM artist LIMIT 1".into(),
            pred_sql_safe: "SELECT COUNT(*) FROM artist LIMIT 1".into(),
            gold_sql_raw: "SELECT COUNT(*) FROM artists LIMIT 1".into(),
            gold_sql_safe: "SELECT COUNT(*) FROM artists LIMIT 1".into(),
            pred_cols: "count".into(),
            gold_cols: String::new(),
            pred_rows: Some(1),
            gold_rows: None,
        };
        write_report(&path, &[report]).unwrap();

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "domain");
        assert_eq!(&headers[2], "status");
        let row = reader.records().next().unwrap().unwrap();
        assert_eq!(&row[1], "How many artists, roughly?");
        assert_eq!(&row[2], "FAIL_EXEC_GOLD");
        assert_eq!(&row[12], "");
    }
}
