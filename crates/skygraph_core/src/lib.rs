/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - SKYGRAPH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod client;
pub mod clock;
pub mod config;
pub mod db;
pub mod deferred;
pub mod firehose;
pub mod indexer;
pub mod labeler;
pub mod plc;
pub mod signing;
pub mod subscriber;
pub mod uri;
