//! Shared fixtures for taxq-ingest integration tests

#![allow(dead_code)]

use sqlx::SqlitePool;
use taxq_common::db::{init_database, Broker};
use taxq_ingest::db::brokers;
use tempfile::TempDir;

pub const ACTOR: &str = "tester";

/// Fresh database in a temporary folder; keep the TempDir alive for the test
pub async fn setup() -> (TempDir, SqlitePool) {
    let dir = tempfile::tempdir().unwrap();
    let pool = init_database(&dir.path().join("taxq.db")).await.unwrap();
    (dir, pool)
}

pub async fn broker(pool: &SqlitePool, code: &str) -> Broker {
    brokers::create_broker(pool, code, &format!("Broker {}", code))
        .await
        .unwrap()
}

pub async fn qualification_count(pool: &SqlitePool) -> i64 {
    taxq_ingest::db::qualifications::count(pool).await.unwrap()
}

/// Header plus amount columns 1..=29
pub fn amounts_header() -> String {
    let mut header = String::from("mercado,instrumento,fecha_pago,ejercicio");
    for index in 1..=29 {
        header.push_str(&format!(",amount{}", index));
    }
    header
}

/// One amounts row with amount1 and amount8 set, the rest zero
pub fn amounts_row(instrument: &str, date: &str, amount1: &str, amount8: &str) -> String {
    let mut row = format!("acciones,{},{},2025,{}", instrument, date, amount1);
    for index in 2..=29 {
        row.push(',');
        row.push_str(if index == 8 { amount8 } else { "0" });
    }
    row
}
