//! courier-core
//!
//! Transactional outbox processing.
//!
//! Rows written to an outbox table in the same transaction as business data are
//! picked up by workers, handed to user handlers, and removed (or rescheduled)
//! in one transaction.
//!
//! # モジュール構成
//! - **domain**: ItemId, OutboxItem, ステータス, 処理結果, エラー
//! - **ports**: 抽象化レイヤー（OutboxRepository, ハンドラ, PartitionStore, Clock）
//! - **app**: ワーカー, リトライ, パーティション管理, スケジューラ
//! - **impls**: in-memory / PostgreSQL 実装

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
