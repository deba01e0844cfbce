//! # KB Maint
//!
//! Operator tooling for keeping a question/answer search index clean.
//!
//! KB Maint finds documents in an Elasticsearch-compatible index (tolerant
//! phrase search, substring search, "field is empty" search), walks every
//! match with a server-side scroll cursor, snapshots what it is about to
//! touch, lets an operator review candidates one by one, and submits the
//! staged edits and deletes as a single bulk request.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Query   │──▶│  Cursor  │──▶│ Snapshot │──▶│  Review  │
//! │ Service  │   │ (scroll) │   │  (JSONL) │   │ machine  │
//! └──────────┘   └──────────┘   └────┬─────┘   └────┬─────┘
//!                                    │ handle        │ batch
//!                                    └──────┬────────┘
//!                                           ▼
//!                                    ┌─────────────┐
//!                                    │ Correction  │──▶ _bulk
//!                                    │  Applier    │
//!                                    └─────────────┘
//! ```
//!
//! Nothing reaches the index as a mutation without a [`snapshot::SnapshotHandle`]
//! covering every affected id: [`apply::CorrectionApplier::apply`] takes one
//! as an argument and refuses ids it does not cover.
//!
//! ## Quick Start
//!
//! ```bash
//! kbm ping                                  # is the index reachable?
//! kbm search "reset password" --mode tolerant
//! kbm backup                                # export everything to ./backups
//! kbm review --value "TODO"                 # fix placeholder answers
//! kbm apply backups/review_qa_20260101_120000.session.json
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, hits, corrections |
//! | [`error`] | Index error taxonomy |
//! | [`index`] | Index client trait, HTTP and in-memory backends |
//! | [`query`] | Query shapes and the bounded top-K search |
//! | [`cursor`] | Exhaustive scroll traversal |
//! | [`snapshot`] | Write-once JSONL snapshots |
//! | [`review`] | Candidate review state machine and sessions |
//! | [`apply`] | Bulk submission of staged corrections |
//! | [`maintenance`] | The operator commands built on the above |
//! | [`progress`] | Progress reporting for long traversals |

pub mod apply;
pub mod config;
pub mod cursor;
pub mod error;
pub mod index;
pub mod maintenance;
pub mod models;
pub mod progress;
pub mod query;
pub mod review;
pub mod snapshot;
