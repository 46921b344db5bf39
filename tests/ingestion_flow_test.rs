// tests/ingestion_flow_test.rs
// End-to-end ingestion runs: first run, incremental runs, backoff, state.

mod common;

use common::*;
use mnemo::db::StateStore;
use mnemo::document::Source;
use mnemo::embeddings::Embedder;
use mnemo::error::MnemoError;
use mnemo::preprocess::{TelegramPreprocessor, WhatsappPreprocessor};
use mnemo::sources::RawBatch;
use serde_json::json;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn test_initial_telegram_run() {
    let dir = tempdir().unwrap();
    let (pool, store) = open_store(dir.path()).await;
    let mut pipeline = pipeline_over(pool.clone(), store.clone());

    pipeline
        .register_ingestor(
            "telegram_ingestor",
            Arc::new(ScriptedAdapter::new(
                Source::Telegram,
                vec![Ok(message_batch(vec![
                    telegram_message("msg1", "C1", 1000, "first message"),
                    telegram_message("msg2", "C1", 2000, "second message"),
                    telegram_message("msg3", "C1", 3000, "third message"),
                ]))],
            )),
            Arc::new(TelegramPreprocessor::new()),
        )
        .await
        .unwrap();

    let summary = pipeline.run_ingestion("telegram_ingestor").await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.documents_processed, 3);

    // Documents landed in the routed collection with stable ids
    assert_eq!(
        store.count(None, Some("telegram_messages")).await.unwrap(),
        3
    );
    let query = HashEmbedder.embed("first message").await.unwrap();
    let hits = store
        .search(&query, 10, None, Some("telegram_messages"))
        .await
        .unwrap();
    let ids: Vec<&str> = hits.iter().map(|h| h.document.id.as_str()).collect();
    assert!(ids.contains(&"telegram_C1_msg1"));

    // Link chains restricted to the batch
    let by_id = |needle: &str| {
        hits.iter()
            .find(|h| h.document.id == needle)
            .map(|h| h.document.clone())
    };
    let first = by_id("telegram_C1_msg1").unwrap();
    let second = by_id("telegram_C1_msg2").unwrap();
    let third = by_id("telegram_C1_msg3").unwrap();
    assert_eq!(first.meta_str("previous_message_ids"), Some(""));
    assert_eq!(second.meta_str("previous_message_ids"), Some("msg1"));
    assert_eq!(third.meta_str("previous_message_ids"), Some("msg1,msg2"));
    assert_eq!(first.meta_str("next_message_ids"), Some("msg2,msg3"));

    // State advanced to the newest message
    let state = StateStore::new(pool);
    let ingestor_state = state.get("telegram_ingestor").await.unwrap();
    assert_eq!(ingestor_state.last_timestamp, 3000);
    assert_eq!(
        ingestor_state.metadata["total_documents_processed"],
        json!(3)
    );
}

#[tokio::test]
async fn test_incremental_whatsapp_run_normalizes_millis() {
    let dir = tempdir().unwrap();
    let (pool, store) = open_store(dir.path()).await;
    let state = StateStore::new(pool.clone());
    let mut pipeline = pipeline_over(pool, store.clone());

    pipeline
        .register_ingestor(
            "whatsapp_ingestor",
            Arc::new(ScriptedAdapter::new(
                Source::Whatsapp,
                vec![Ok(message_batch(vec![whatsapp_message(
                    "w1",
                    "family@g.us",
                    3_000_000,
                    "new message",
                )]))],
            )),
            Arc::new(WhatsappPreprocessor::new()),
        )
        .await
        .unwrap();

    // Simulate a previous run at 2000 seconds
    state
        .set("whatsapp_ingestor", 2000, serde_json::Map::new())
        .await
        .unwrap();

    let summary = pipeline.run_ingestion("whatsapp_ingestor").await.unwrap();
    assert!(summary.success);
    assert_eq!(summary.documents_processed, 1);

    // 3,000,000 ms normalize to 3000 s and the state advances to it
    let ingestor_state = state.get("whatsapp_ingestor").await.unwrap();
    assert_eq!(ingestor_state.last_timestamp, 3000);
    assert_eq!(
        store.count(None, Some("whatsapp_messages")).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_rate_limited_fetch_recovers_without_data_loss() {
    let dir = tempdir().unwrap();
    let (pool, store) = open_store(dir.path()).await;
    let state = StateStore::new(pool.clone());
    let mut pipeline = pipeline_over(pool, store.clone());

    pipeline
        .register_ingestor(
            "telegram_ingestor",
            Arc::new(ScriptedAdapter::new(
                Source::Telegram,
                vec![
                    Err(MnemoError::RateLimited { wait_seconds: 2 }),
                    Err(MnemoError::RateLimited { wait_seconds: 2 }),
                    Ok(message_batch(vec![telegram_message(
                        "msg1", "C1", 5000, "after backoff",
                    )])),
                ],
            )),
            Arc::new(TelegramPreprocessor::new()),
        )
        .await
        .unwrap();

    // Paused time lets the 2s + 4s backoff elapse instantly
    tokio::time::pause();
    let summary = pipeline.run_ingestion("telegram_ingestor").await.unwrap();
    tokio::time::resume();

    assert!(summary.success);
    assert_eq!(summary.documents_processed, 1);
    assert!(summary.errors.is_empty());
    assert_eq!(
        state.get("telegram_ingestor").await.unwrap().last_timestamp,
        5000
    );
}

#[tokio::test]
async fn test_state_timestamp_monotone_across_runs() {
    let dir = tempdir().unwrap();
    let (pool, store) = open_store(dir.path()).await;
    let state = StateStore::new(pool.clone());
    let mut pipeline = pipeline_over(pool, store);

    pipeline
        .register_ingestor(
            "telegram_ingestor",
            Arc::new(ScriptedAdapter::new(
                Source::Telegram,
                vec![
                    Ok(message_batch(vec![telegram_message("m1", "C1", 9000, "newest")])),
                    Ok(message_batch(vec![telegram_message("m0", "C1", 100, "stale")])),
                    Ok(RawBatch::default()),
                ],
            )),
            Arc::new(TelegramPreprocessor::new()),
        )
        .await
        .unwrap();

    let mut last_seen = 0;
    for _ in 0..3 {
        let summary = pipeline.run_ingestion("telegram_ingestor").await.unwrap();
        assert!(summary.success);
        let current = state.get("telegram_ingestor").await.unwrap().last_timestamp;
        assert!(current >= last_seen, "state must never move backwards");
        last_seen = current;
    }
    assert_eq!(last_seen, 9000);
}

#[tokio::test]
async fn test_repeated_run_upserts_not_duplicates() {
    let dir = tempdir().unwrap();
    let (pool, store) = open_store(dir.path()).await;
    let mut pipeline = pipeline_over(pool, store.clone());

    let batch = || {
        Ok(message_batch(vec![
            telegram_message("m1", "C1", 1000, "hello"),
            telegram_message("m2", "C1", 2000, "world"),
        ]))
    };
    pipeline
        .register_ingestor(
            "telegram_ingestor",
            Arc::new(ScriptedAdapter::new(Source::Telegram, vec![batch(), batch()])),
            Arc::new(TelegramPreprocessor::new()),
        )
        .await
        .unwrap();

    pipeline.run_ingestion("telegram_ingestor").await.unwrap();
    pipeline.run_ingestion("telegram_ingestor").await.unwrap();

    assert_eq!(
        store.count(None, Some("telegram_messages")).await.unwrap(),
        2
    );
}
