//! Bulk file ingestion against a real database

mod common;

use common::{amounts_header, amounts_row, broker, qualification_count, setup, ACTOR};
use rust_decimal::Decimal;
use std::str::FromStr;
use taxq_common::db::{FactorStatus, Market, Provenance, QualificationKey, Scope};
use taxq_common::ValidationError;
use taxq_ingest::db::{audit, qualifications};
use taxq_ingest::services::{ingest, BulkLoadSummary, BulkMode};
use taxq_ingest::IngestError;

fn dec(text: &str) -> Decimal {
    Decimal::from_str(text).unwrap()
}

fn key(scope: Scope, instrument: &str, date: (i32, u32, u32)) -> QualificationKey {
    QualificationKey {
        scope,
        market: Market::Acciones,
        instrument: instrument.to_string(),
        payment_date: chrono::NaiveDate::from_ymd_opt(date.0, date.1, date.2).unwrap(),
        exercise_year: 2025,
    }
}

#[tokio::test]
async fn test_same_row_twice_updates_in_place() {
    let (_dir, pool) = setup().await;
    let content = format!(
        "{}\n{}\n",
        amounts_header(),
        amounts_row("COPEC", "2025-05-10", "200", "50")
    );

    let first = ingest(&pool, ACTOR, Scope::Baseline, &content, BulkMode::Amounts)
        .await
        .unwrap();
    let second = ingest(&pool, ACTOR, Scope::Baseline, &content, BulkMode::Amounts)
        .await
        .unwrap();

    assert_eq!(first, BulkLoadSummary { created: 1, updated: 0, skipped: 0 });
    assert_eq!(second, BulkLoadSummary { created: 0, updated: 1, skipped: 0 });
    assert_eq!(qualification_count(&pool).await, 1);

    let stored = qualifications::get_by_key(&pool, &key(Scope::Baseline, "COPEC", (2025, 5, 10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.provenance, Provenance::BulkAmounts);
    assert_eq!(stored.factor_status, FactorStatus::Current);
    assert_eq!(stored.amounts.get(1), dec("200"));
    assert_eq!(stored.factors.get(8), dec("0.25"));
}

#[tokio::test]
async fn test_bad_date_rolls_back_whole_file() {
    let (_dir, pool) = setup().await;
    let content = format!(
        "{}\n{}\n{}\n",
        amounts_header(),
        amounts_row("COPEC", "2025-05-10", "100", "10"),
        amounts_row("SQM", "31/31/2025", "100", "10")
    );

    let err = ingest(&pool, ACTOR, Scope::Baseline, &content, BulkMode::Amounts)
        .await
        .unwrap_err();

    match err {
        IngestError::BadDate { row, instrument, raw } => {
            assert_eq!(row, 3);
            assert_eq!(instrument, "SQM");
            assert_eq!(raw, "31/31/2025");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(qualification_count(&pool).await, 0);
    assert!(audit::recent_entries(&pool, None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_factor_sum_violation_aborts_and_reports_row() {
    let (_dir, pool) = setup().await;
    let content = "mercado;instrumento;fecha_pago;ejercicio;amount1;amount8;amount9\n\
                   acciones;COPEC;2025-05-10;2025;100;10;10\n\
                   acciones;SQM;10/05/2025;2025;100;50;60\n";

    let err = ingest(&pool, ACTOR, Scope::Baseline, content, BulkMode::Amounts)
        .await
        .unwrap_err();

    match err {
        IngestError::Invalid { row, instrument, payment_date, source } => {
            assert_eq!(row, 3);
            assert_eq!(instrument, "SQM");
            assert_eq!(payment_date.to_string(), "2025-05-10");
            assert_eq!(source, ValidationError::FactorSumExceeded { sum: dec("1.1") });
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(qualification_count(&pool).await, 0);
}

#[tokio::test]
async fn test_out_of_range_amounts_abort_with_row_error() {
    let (_dir, pool) = setup().await;
    let tiny_divisor = "mercado,instrumento,fecha_pago,ejercicio,amount1,amount8\n\
                        acciones,COPEC,2025-05-10,2025,0.0000000000000000000000000001,79228162514264337593543950335\n";
    let huge_bucket = "mercado,instrumento,fecha_pago,ejercicio,amount1,amount8,amount9\n\
                       acciones,COPEC,2025-05-10,2025,100,10,0\n\
                       acciones,SQM,2025-05-10,2025,1,79228162514264337593543950335,79228162514264337593543950335\n";

    for (content, expected_row, expected_instrument) in [(tiny_divisor, 2, "COPEC"), (huge_bucket, 3, "SQM")] {
        let err = ingest(&pool, ACTOR, Scope::Baseline, content, BulkMode::Amounts)
            .await
            .unwrap_err();

        match err {
            IngestError::Invalid { row, instrument, source, .. } => {
                assert_eq!(row, expected_row);
                assert_eq!(instrument, expected_instrument);
                assert_eq!(source, ValidationError::AmountOverflow { factor: 8 });
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
    assert_eq!(qualification_count(&pool).await, 0);
}

#[tokio::test]
async fn test_out_of_range_factor_sum_aborts_factors_load() {
    let (_dir, pool) = setup().await;
    let content = "market,instrument,payment_date,year,factor8,factor9\n\
                   acciones,COPEC,2025-05-10,2025,79228162514264337593543950335,79228162514264337593543950335\n";

    let err = ingest(&pool, ACTOR, Scope::Baseline, content, BulkMode::Factors)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        IngestError::Invalid { row: 2, source: ValidationError::FactorSumOverflow, .. }
    ));
    assert_eq!(qualification_count(&pool).await, 0);
}

#[tokio::test]
async fn test_factors_mode_keeps_existing_amounts() {
    let (_dir, pool) = setup().await;
    let tenant = broker(&pool, "BRK1").await;
    let scope = Scope::from(&tenant);

    let amounts = format!(
        "{}\n{}\n",
        amounts_header(),
        amounts_row("COPEC", "2025-05-10", "200", "50")
    );
    ingest(&pool, ACTOR, scope, &amounts, BulkMode::Amounts).await.unwrap();

    let factors = "market|instrument|payment_date|year|factor8|factor9|factor20\n\
                   acciones|COPEC|2025-05-10|2025|0.4|0.6|7\n\
                   acciones|BCI|2025-05-11|2025|0.1||\n";
    let summary = ingest(&pool, ACTOR, scope, factors, BulkMode::Factors).await.unwrap();
    assert_eq!(summary, BulkLoadSummary { created: 1, updated: 1, skipped: 0 });

    let copec = qualifications::get_by_key(&pool, &key(scope, "COPEC", (2025, 5, 10)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(copec.provenance, Provenance::BulkFactors);
    assert_eq!(copec.amounts.get(1), dec("200"));
    assert_eq!(copec.amounts.get(8), dec("50"));
    assert_eq!(copec.factors.get(8), dec("0.4"));
    assert_eq!(copec.factors.get(9), dec("0.6"));
    assert_eq!(copec.factors.get(20), dec("7"));

    let bci = qualifications::get_by_key(&pool, &key(scope, "BCI", (2025, 5, 11)))
        .await
        .unwrap()
        .unwrap();
    assert!(bci.amounts.as_array().iter().all(|a| a.is_zero()));
    assert_eq!(bci.factors.get(8), dec("0.1"));
}

#[tokio::test]
async fn test_rows_without_identity_are_skipped() {
    let (_dir, pool) = setup().await;
    let content = "\u{feff}mercado\tinstrumento\tfecha_pago\tejercicio\tamount1\textra\n\
                   acciones\tCOPEC\t2025-05-10\t2025\t100\tignored\n\
                   \t\t\t\t\t\n\
                   acciones\t\t2025-05-10\t2025\t100\t\n\
                   acciones\tSQM\t2025-05-10\t\t100\t\n";

    let summary = ingest(&pool, ACTOR, Scope::Baseline, content, BulkMode::Amounts)
        .await
        .unwrap();

    assert_eq!(summary, BulkLoadSummary { created: 1, updated: 0, skipped: 2 });
    assert_eq!(qualification_count(&pool).await, 1);
}

#[tokio::test]
async fn test_audit_has_row_entries_and_summary() {
    let (_dir, pool) = setup().await;
    let content = format!(
        "{}\n{}\n{}\n",
        amounts_header(),
        amounts_row("COPEC", "2025-05-10", "100", "10"),
        amounts_row("SQM", "2025-05-11", "100", "10")
    );

    ingest(&pool, "loader", Scope::Baseline, &content, BulkMode::Amounts)
        .await
        .unwrap();

    let entries = audit::recent_entries(&pool, Some("loader"), 10).await.unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, "BULK_LOAD");
    assert!(entries[0].qualification_guid.is_none());
    assert!(entries[0].details.contains("2 created"));

    let row_details: Vec<&str> = entries[1..].iter().map(|e| e.details.as_str()).collect();
    assert!(row_details.iter().any(|d| d.contains("row 2") && d.contains("COPEC")));
    assert!(row_details.iter().any(|d| d.contains("row 3") && d.contains("SQM")));
    assert!(entries[1..].iter().all(|e| e.action == "BULK_LOAD_AMOUNTS"));
}

#[tokio::test]
async fn test_empty_file_is_malformed_but_header_only_is_fine() {
    let (_dir, pool) = setup().await;

    let err = ingest(&pool, ACTOR, Scope::Baseline, "  \n", BulkMode::Amounts)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::Malformed(_)));

    let summary = ingest(&pool, ACTOR, Scope::Baseline, &amounts_header(), BulkMode::Amounts)
        .await
        .unwrap();
    assert_eq!(summary, BulkLoadSummary::default());
}

#[tokio::test]
async fn test_zero_divisor_loads_zero_factors() {
    let (_dir, pool) = setup().await;
    let content = "mercado,instrumento,fecha_pago,ejercicio,amount1,amount8,amount20\n\
                   acciones,COPEC,2025-05-10,2025,0,999,5\n";

    ingest(&pool, ACTOR, Scope::Baseline, content, BulkMode::Amounts)
        .await
        .unwrap();

    let stored = qualifications::get_by_key(&pool, &key(Scope::Baseline, "COPEC", (2025, 5, 10)))
        .await
        .unwrap()
        .unwrap();
    assert!(stored.factors.as_array().iter().all(|f| f.is_zero()));
    assert_eq!(stored.amounts.get(8), dec("999"));
}
