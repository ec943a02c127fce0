//! # Repository Module
//!
//! Database repository implementations for GlucoSync.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Sync engine                                                            │
//! │       │                                                                 │
//! │       │  db.glucose().import_json(payload)                              │
//! │       ▼                                                                 │
//! │  GlucoseRepository                                                     │
//! │  ├── import_json / insert_if_absent                                    │
//! │  ├── export_since / export_json_since                                  │
//! │  ├── delete_older_than                                                 │
//! │  └── count / latest / oldest_timestamp                                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod glucose;
