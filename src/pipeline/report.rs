use std::time::Duration;

use crate::model::EvaluationResult;

const RULE_WIDTH: usize = 60;

pub fn render_report(
    system_name: &str,
    elapsed: Duration,
    evaluation: Option<&EvaluationResult>,
) -> String {
    let rule = "=".repeat(RULE_WIDTH);
    let mut lines = vec![
        rule.clone(),
        "Evaluation Report".to_string(),
        rule.clone(),
        String::new(),
        format!("System: {system_name}"),
        format!("Time Elapsed: {:.2}s", elapsed.as_secs_f64()),
        String::new(),
    ];

    if let Some(result) = evaluation {
        lines.push(format!("Total Questions: {}", result.total_questions));
        lines.push(format!("Correct: {}", result.correct));
        lines.push(format!("Accuracy: {:.2}%", result.accuracy * 100.0));
        lines.push(String::new());
    }

    lines.push(rule);
    let mut report = lines.join("\n");
    report.push('\n');
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Metadata;

    #[test]
    fn report_includes_evaluation_totals() {
        let result = EvaluationResult::from_counts(4, 3, Vec::new(), Metadata::new());
        let report = render_report("sqlite-fts", Duration::from_millis(1500), Some(&result));

        assert!(report.contains("System: sqlite-fts"));
        assert!(report.contains("Time Elapsed: 1.50s"));
        assert!(report.contains("Total Questions: 4"));
        assert!(report.contains("Correct: 3"));
        assert!(report.contains("Accuracy: 75.00%"));
    }

    #[test]
    fn report_without_evaluation_has_no_totals() {
        let report = render_report("sqlite-fts", Duration::ZERO, None);
        assert!(!report.contains("Total Questions"));
        assert!(report.starts_with(&"=".repeat(RULE_WIDTH)));
    }
}
