// ABOUTME: Helpers for the wrpc diagnostic CLI.
// ABOUTME: Parses JSON arguments and builds the queries and masks the subcommands use.

//! # wrpc-cli
//!
//! Diagnostic command-line interface for an orchestration backend.
//!
//! ```text
//! wrpc
//! ├── call <service> <method>         # Single-result call, prints the result
//! ├── list <service> <method>         # List-style call, prints one record per line
//! ├── wait-exists <service> <method>  # Poll until a matching record is listed
//! ├── wait-removed <service> <method> # Poll until no matching record is listed
//! ├── mask <payload>                  # Derive a field mask offline
//! └── version                         # Show version info
//! ```
//!
//! ## Usage
//!
//! ```bash
//! wrpc call Network.Vpc Get --body '{"id":"v-1"}'
//! wrpc list Network.Vpc List --key-prefix vpc
//! wrpc wait-exists Network.Vpc List --key-prefix vpc --field name --equals prod
//! wrpc mask '{"display_name":"prod","detail":{"region":"eu"}}' --inner detail
//! ```

use anyhow::{bail, Context, Result};
use serde_json::Value;
use wrpc_client::{derive_mask, merge_inner_mask, FieldMask, ListQuery};

/// Version of the wrpc CLI
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse an optional JSON body argument. Missing means `{}`.
pub fn parse_body(body: Option<&str>) -> Result<Value> {
    match body {
        None => Ok(Value::Object(Default::default())),
        Some(text) => serde_json::from_str(text).context("--body is not valid JSON"),
    }
}

pub fn list_query(service: &str, method: &str, body: Option<&str>, key_prefix: &str) -> Result<ListQuery> {
    Ok(ListQuery::new(service, method, parse_body(body)?).with_key_prefix(key_prefix))
}

/// Mask for `payload`, with each `inner` field expanded into its own paths.
pub fn mask_for(payload: &str, prefix: &str, inner: &[String]) -> Result<FieldMask> {
    let value: Value = serde_json::from_str(payload).context("payload is not valid JSON")?;
    let mut mask = derive_mask(&value, prefix)?;

    for name in inner {
        let Some(inner_value) = value.get(name) else {
            bail!("payload has no field '{}'", name);
        };
        let outer_name = wrpc_client::mask::to_lower_camel(name);
        let inner_prefix = if prefix.is_empty() {
            outer_name
        } else {
            format!("{}.{}", prefix.trim_end_matches('.'), outer_name)
        };
        mask = merge_inner_mask(inner_value, mask, &inner_prefix)?;
    }
    Ok(mask)
}
