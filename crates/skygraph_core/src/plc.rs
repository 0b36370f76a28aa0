/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! PLC directory and handle lookups.

use anyhow::{bail, Context, Result};
use chrono::DateTime;
use serde::Deserialize;

const PLC_DIRECTORY: &str = "https://plc.directory";

#[derive(Debug, Deserialize)]
struct PlcAuditRecord {
    #[serde(rename = "createdAt", default)]
    created_at: String,
}

/// Epoch of the did's first audit-log entry; 0 when the directory does
/// not know it.
pub async fn lookup_plc_created_at(http: &reqwest::Client, did: &str) -> Result<i64> {
    let url = format!("{PLC_DIRECTORY}/{did}/log/audit");
    let resp = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("get {url}"))?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(0);
    }
    if !resp.status().is_success() {
        bail!("plc directory returned {} for {did}", resp.status());
    }

    let records: Vec<PlcAuditRecord> = resp
        .json()
        .await
        .with_context(|| format!("parse plc audit log for {did}"))?;
    let Some(first) = records.first() else {
        return Ok(0);
    };
    let created = DateTime::parse_from_rfc3339(&first.created_at)
        .with_context(|| format!("parse createdAt {} for {did}", first.created_at))?;
    Ok(created.timestamp())
}

#[derive(Debug, Deserialize)]
struct PlcDirectoryRecord {
    #[serde(default)]
    service: Vec<PlcService>,
}

#[derive(Debug, Deserialize)]
struct PlcService {
    #[serde(rename = "serviceEndpoint", default)]
    service_endpoint: String,
}

/// PDS endpoint registered for the did.
pub async fn lookup_pds(http: &reqwest::Client, did: &str) -> Result<String> {
    let url = format!("{PLC_DIRECTORY}/{did}");
    let resp = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("get {url}"))?;
    if !resp.status().is_success() {
        bail!("plc directory returned {} for {did}", resp.status());
    }
    let record: PlcDirectoryRecord = resp
        .json()
        .await
        .with_context(|| format!("parse plc record for {did}"))?;
    match record.service.as_slice() {
        [service] => Ok(service.service_endpoint.clone()),
        other => bail!("expected one service record for {did}, found {}", other.len()),
    }
}

/// Resolve a handle to a did over the https well-known endpoint.
/// Already-resolved dids pass through.
pub async fn resolve_handle(http: &reqwest::Client, handle: &str) -> Result<String> {
    if handle.starts_with("did:") {
        return Ok(handle.to_string());
    }

    let url = format!("https://{handle}/.well-known/atproto-did");
    let resp = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("get {url}"))?;
    if !resp.status().is_success() {
        bail!(
            "could not lookup did for {handle}: {url} returned {}",
            resp.status()
        );
    }
    let did = resp.text().await?.trim().to_string();
    if !did.starts_with("did:") {
        bail!("https verification for {handle} returned {did}, not a did");
    }
    Ok(did)
}
