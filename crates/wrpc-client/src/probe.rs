// ABOUTME: Standard convergence probes built on list-style calls.
// ABOUTME: Record exists, derived field populated, record removed, and single-shot duplicate check.

use serde_json::Value;

use crate::client::Client;
use crate::codec::Envelope;
use crate::connect::Dialer;
use crate::error::{ConvergenceError, RpcError};
use crate::retry::{retry_until, retry_until_cancelled, ProbeOutcome, RetryPolicy};
use crate::stream::raw_record;

/// A list-style request and the result keys that carry its records.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub service: String,
    pub method: String,
    pub body: Value,
    /// Keys of `result` starting with this are records; empty matches all.
    pub key_prefix: String,
}

impl ListQuery {
    pub fn new(service: impl Into<String>, method: impl Into<String>, body: Value) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            body,
            key_prefix: String::new(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// A fresh envelope for one probe round trip.
    pub fn envelope(&self) -> Envelope {
        Envelope::new(&self.service, &self.method, self.body.clone())
    }

    fn describe(&self) -> String {
        format!("{}.{}", self.service, self.method)
    }
}

/// Follow a dotted path such as `status.vpcId` into a record.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(record, |value, segment| value.get(segment))
}

/// True if `value` holds something other than its zero value.
pub fn is_populated(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Equality on a single field, for use as a record predicate.
pub fn field_equals<'a>(path: &'a str, expected: &'a str) -> impl Fn(&Value) -> bool + 'a {
    move |record| lookup(record, path).and_then(Value::as_str) == Some(expected)
}

async fn fetch<D: Dialer>(client: &Client<D>, query: &ListQuery) -> Result<Vec<Value>, RpcError> {
    let prefix = query.key_prefix.as_str();
    client
        .list(&query.envelope(), |key: &str| key.starts_with(prefix), raw_record)
        .await
}

/// Broken channels are worth another poll; everything else stops the loop.
fn classify<T>(error: RpcError) -> ProbeOutcome<T, RpcError> {
    if error.is_transient() {
        ProbeOutcome::Retryable(error.to_string())
    } else {
        ProbeOutcome::Fatal(error)
    }
}

async fn poll<D, T, F, Fut>(
    client: &Client<D>,
    policy: &RetryPolicy,
    probe: F,
) -> Result<T, ConvergenceError<RpcError>>
where
    D: Dialer,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProbeOutcome<T, RpcError>>,
{
    match client.cancellation() {
        Some(token) => retry_until_cancelled(policy, token, probe).await,
        None => retry_until(policy, probe).await,
    }
}

/// One round trip: is there a record matching `predicate`?
pub async fn probe_exists<D, P>(
    client: &Client<D>,
    query: &ListQuery,
    predicate: &P,
) -> ProbeOutcome<Value, RpcError>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    match fetch(client, query).await {
        Ok(records) => match records.into_iter().find(|r| predicate(r)) {
            Some(record) => ProbeOutcome::Converged(record),
            None => ProbeOutcome::Retryable(format!("no matching record in {}", query.describe())),
        },
        Err(e) => classify(e),
    }
}

/// One round trip: does the matching record have `field` populated?
pub async fn probe_field<D, P>(
    client: &Client<D>,
    query: &ListQuery,
    predicate: &P,
    field: &str,
) -> ProbeOutcome<Value, RpcError>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    match probe_exists(client, query, predicate).await {
        ProbeOutcome::Converged(record) => match lookup(&record, field) {
            Some(value) if is_populated(value) => ProbeOutcome::Converged(value.clone()),
            _ => ProbeOutcome::Retryable(format!("field '{field}' not populated yet")),
        },
        other => other,
    }
}

/// One round trip: is the matching record gone?
pub async fn probe_removed<D, P>(
    client: &Client<D>,
    query: &ListQuery,
    predicate: &P,
) -> ProbeOutcome<(), RpcError>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    match fetch(client, query).await {
        Ok(records) if records.iter().any(|r| predicate(r)) => {
            ProbeOutcome::Retryable(format!("record still listed by {}", query.describe()))
        }
        Ok(_) => ProbeOutcome::Converged(()),
        Err(e) => classify(e),
    }
}

/// Poll until a record matching `predicate` is listed, returning it.
pub async fn record_exists<D, P>(
    client: &Client<D>,
    policy: &RetryPolicy,
    query: &ListQuery,
    predicate: P,
) -> Result<Value, ConvergenceError<RpcError>>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    poll(client, policy, || probe_exists(client, query, &predicate)).await
}

/// Poll until the matching record has `field` populated, returning the field's value.
///
/// Used for values the backend fills in asynchronously, such as generated
/// configuration or an allocated identifier.
pub async fn field_populated<D, P>(
    client: &Client<D>,
    policy: &RetryPolicy,
    query: &ListQuery,
    predicate: P,
    field: &str,
) -> Result<Value, ConvergenceError<RpcError>>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    poll(client, policy, || probe_field(client, query, &predicate, field)).await
}

/// Poll until no record matches `predicate`.
pub async fn record_removed<D, P>(
    client: &Client<D>,
    policy: &RetryPolicy,
    query: &ListQuery,
    predicate: P,
) -> Result<(), ConvergenceError<RpcError>>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    poll(client, policy, || probe_removed(client, query, &predicate)).await
}

/// Single check for an existing record matching `predicate`, without polling.
pub async fn find_duplicate<D, P>(
    client: &Client<D>,
    query: &ListQuery,
    predicate: P,
) -> Result<Option<Value>, RpcError>
where
    D: Dialer,
    P: Fn(&Value) -> bool,
{
    let records = fetch(client, query).await?;
    let duplicate = records.into_iter().find(|r| predicate(r));
    if duplicate.is_some() {
        tracing::debug!(query = %query.describe(), "duplicate record found");
    }
    Ok(duplicate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Scripted, ScriptedDialer, ScriptedTransport};
    use serde_json::json;
    use std::time::Duration;

    fn query() -> ListQuery {
        ListQuery::new("Network.Vpc", "List", json!({})).with_key_prefix("vpc")
    }

    fn listing(records: Vec<Value>) -> ScriptedTransport {
        let mut result = serde_json::Map::new();
        for (i, record) in records.into_iter().enumerate() {
            result.insert(format!("vpc_{i}"), record);
        }
        ScriptedTransport::replying(vec![json!({ "result": result }), json!({"error": "EOF"})])
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(30))
    }

    #[test]
    fn test_lookup_and_populated() {
        let record = json!({"status": {"vpcId": "v-1", "routes": []}, "name": ""});
        assert_eq!(lookup(&record, "status.vpcId"), Some(&json!("v-1")));
        assert!(lookup(&record, "status.missing").is_none());
        assert!(is_populated(lookup(&record, "status.vpcId").unwrap()));
        assert!(!is_populated(lookup(&record, "status.routes").unwrap()));
        assert!(!is_populated(lookup(&record, "name").unwrap()));
        assert!(field_equals("status.vpcId", "v-1")(&record));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_exists_polls_until_listed() {
        let client = Client::new(ScriptedDialer::with_transports(vec![
            listing(vec![]),
            listing(vec![json!({"name": "other"})]),
            listing(vec![json!({"name": "other"}), json!({"name": "prod"})]),
        ]));

        let record = record_exists(&client, &policy(), &query(), field_equals("name", "prod"))
            .await
            .unwrap();
        assert_eq!(record["name"], "prod");
        assert_eq!(client.dialer().attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_field_populated_returns_value() {
        let client = Client::new(ScriptedDialer::with_transports(vec![
            listing(vec![json!({"name": "prod", "status": {"config": ""}})]),
            listing(vec![json!({"name": "prod", "status": {"config": "generated"}})]),
        ]));

        let value = field_populated(
            &client,
            &policy(),
            &query(),
            field_equals("name", "prod"),
            "status.config",
        )
        .await
        .unwrap();
        assert_eq!(value, json!("generated"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_removed_times_out_while_still_listed() {
        let transports = (0..20)
            .map(|_| listing(vec![json!({"name": "prod"})]))
            .collect();
        let client = Client::new(ScriptedDialer::with_transports(transports));
        let policy = RetryPolicy::new(Duration::from_secs(2), Duration::from_secs(6));

        let err = record_removed(&client, &policy, &query(), field_equals("name", "prod"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConvergenceError::TimedOut { attempts: 4, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_error_aborts_probe() {
        let client = Client::new(ScriptedDialer::with_transports(vec![
            ScriptedTransport::replying(vec![json!({"error": "permission denied"})]),
        ]));

        let err = record_exists(&client, &policy(), &query(), |_: &Value| true)
            .await
            .unwrap_err();
        match err {
            ConvergenceError::Aborted(e) => {
                assert_eq!(e.application_message(), Some("permission denied"))
            }
            other => panic!("expected Aborted, got {:?}", other),
        }
        assert_eq!(client.dialer().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_connection_is_polled_again() {
        let client = Client::new(ScriptedDialer::with_transports(vec![
            ScriptedTransport::new(vec![Scripted::Closed]),
            listing(vec![]),
        ]));

        record_removed(&client, &policy(), &query(), |_: &Value| true)
            .await
            .unwrap();
        assert_eq!(client.dialer().attempts(), 2);
    }

    #[tokio::test]
    async fn test_find_duplicate_is_single_shot() {
        let client = Client::new(ScriptedDialer::with_transports(vec![listing(vec![
            json!({"name": "prod"}),
        ])]));

        let found = find_duplicate(&client, &query(), field_equals("name", "prod"))
            .await
            .unwrap();
        assert_eq!(found, Some(json!({"name": "prod"})));
        assert_eq!(client.dialer().attempts(), 1);

        let client = Client::new(ScriptedDialer::with_transports(vec![listing(vec![])]));
        let found = find_duplicate(&client, &query(), field_equals("name", "prod"))
            .await
            .unwrap();
        assert!(found.is_none());
    }
}
