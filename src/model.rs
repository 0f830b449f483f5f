use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub speaker_name: String,
    pub role: String,
    /// RFC 3339, or a naive `YYYY-MM-DDTHH:MM:SS[.f]` taken as UTC.
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Conversation {
    pub fn speaker_a(&self) -> &str {
        metadata_str(&self.metadata, "speaker_a").unwrap_or("User")
    }

    pub fn speaker_b(&self) -> &str {
        metadata_str(&self.metadata, "speaker_b").unwrap_or("Assistant")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QaPair {
    #[serde(default)]
    pub question_id: String,
    pub question: String,
    pub golden_answer: String,
    #[serde(deserialize_with = "deserialize_category")]
    pub category: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl QaPair {
    pub fn conversation_id(&self) -> Option<&str> {
        metadata_str(&self.metadata, "conversation_id")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub dataset_name: String,
    pub conversations: Vec<Conversation>,
    pub qa_pairs: Vec<QaPair>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// One retrieved memory. Adapter-specific keys beyond the common four are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedMemory {
    pub content: String,
    pub score: f64,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(flatten)]
    pub extra: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query: String,
    pub conversation_id: String,
    pub results: Vec<RetrievedMemory>,
    #[serde(default)]
    pub retrieval_metadata: Metadata,
}

impl SearchResult {
    /// Context handed to the answer provider: the adapter's own rendering when present,
    /// otherwise the retrieved contents one per line.
    pub fn formatted_context(&self) -> String {
        if let Some(context) = metadata_str(&self.retrieval_metadata, "formatted_context") {
            return context.to_string();
        }

        self.results
            .iter()
            .map(|memory| memory.content.as_str())
            .collect::<Vec<&str>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResult {
    pub question_id: String,
    pub question: String,
    pub answer: String,
    pub golden_answer: String,
    pub category: String,
    pub conversation_id: String,
    pub formatted_context: String,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub total_questions: usize,
    pub correct: usize,
    pub accuracy: f64,
    pub detailed_results: Vec<Value>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl EvaluationResult {
    pub fn from_counts(
        total_questions: usize,
        correct: usize,
        detailed_results: Vec<Value>,
        metadata: Metadata,
    ) -> Self {
        let correct = correct.min(total_questions);
        Self {
            total_questions,
            correct,
            accuracy: accuracy(correct, total_questions),
            detailed_results,
            metadata,
        }
    }
}

pub fn accuracy(correct: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    correct as f64 / total as f64
}

pub fn metadata_str<'a>(metadata: &'a Metadata, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(Value::as_str)
}

/// Datasets tag categories with integers or strings; both compare as strings.
pub fn normalize_category(value: &Value) -> String {
    match value {
        Value::String(text) => text.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn deserialize_category<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_category(&value))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(parsed.with_timezone(&Utc)));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Some(naive.and_utc()))
        .ok_or_else(|| serde::de::Error::custom(format!("invalid message timestamp: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accuracy_is_zero_when_no_questions() {
        let result = EvaluationResult::from_counts(0, 0, Vec::new(), Metadata::new());
        assert_eq!(result.accuracy, 0.0);
    }

    #[test]
    fn accuracy_divides_correct_by_total() {
        let result = EvaluationResult::from_counts(10, 7, Vec::new(), Metadata::new());
        assert!((result.accuracy - 0.7).abs() < f64::EPSILON);
        assert_eq!(result.correct, 7);
    }

    #[test]
    fn integer_categories_deserialize_as_strings() {
        let raw = json!({
            "question": "Where did Ana move?",
            "golden_answer": "Lisbon",
            "category": 5,
            "metadata": {"conversation_id": "conv-1"}
        });

        let qa: QaPair = serde_json::from_value(raw).expect("qa pair should deserialize");
        assert_eq!(qa.category, "5");
        assert_eq!(qa.conversation_id(), Some("conv-1"));
        assert!(qa.question_id.is_empty());
    }

    #[test]
    fn message_timestamps_accept_offsets_and_naive_values() {
        let message = |timestamp: Value| -> Message {
            serde_json::from_value(json!({
                "speaker_name": "Ana",
                "role": "user",
                "timestamp": timestamp,
                "content": "hi"
            }))
            .expect("message should deserialize")
        };

        let naive = message(json!("2023-05-08T13:56:00"));
        let zulu = message(json!("2023-05-08T13:56:00Z"));
        let offset = message(json!("2023-05-08T15:56:00+02:00"));
        assert!(naive.timestamp.is_some());
        assert_eq!(naive.timestamp, zulu.timestamp);
        assert_eq!(offset.timestamp, zulu.timestamp);
        assert!(message(Value::Null).timestamp.is_none());

        let missing: Message = serde_json::from_value(json!({
            "speaker_name": "Ana",
            "role": "user",
            "content": "hi"
        }))
        .expect("timestamp is optional");
        assert!(missing.timestamp.is_none());

        let invalid = serde_json::from_value::<Message>(json!({
            "speaker_name": "Ana",
            "role": "user",
            "timestamp": "yesterday",
            "content": "hi"
        }));
        assert!(invalid.is_err());
    }

    #[test]
    fn search_result_keeps_adapter_specific_item_keys() {
        let raw = json!({
            "query": "q",
            "conversation_id": "conv-1",
            "results": [{
                "content": "Ana moved to Lisbon",
                "score": 0.123456789012345_f64,
                "user_id": "conv-1_ana",
                "metadata": {"message_index": 3},
                "memory_type": "episodic"
            }],
            "retrieval_metadata": {"top_k": 5}
        });

        let parsed: SearchResult =
            serde_json::from_value(raw.clone()).expect("search result should deserialize");
        assert_eq!(
            parsed.results[0].extra.get("memory_type"),
            Some(&json!("episodic"))
        );
        assert_eq!(serde_json::to_value(&parsed).expect("serialize"), raw);
    }

    #[test]
    fn formatted_context_prefers_adapter_rendering() {
        let mut result = SearchResult {
            query: "q".to_string(),
            conversation_id: "c".to_string(),
            results: vec![
                RetrievedMemory {
                    content: "first".to_string(),
                    score: 2.0,
                    user_id: None,
                    metadata: Metadata::new(),
                    extra: Metadata::new(),
                },
                RetrievedMemory {
                    content: "second".to_string(),
                    score: 1.0,
                    user_id: None,
                    metadata: Metadata::new(),
                    extra: Metadata::new(),
                },
            ],
            retrieval_metadata: Metadata::new(),
        };
        assert_eq!(result.formatted_context(), "first\nsecond");

        result
            .retrieval_metadata
            .insert("formatted_context".to_string(), json!("rendered"));
        assert_eq!(result.formatted_context(), "rendered");
    }
}
