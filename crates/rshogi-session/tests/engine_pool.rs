//! 解析プールの結合テスト

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use crossbeam_channel::unbounded;
use rshogi_session::analysis::{AnalysisEvent, AnalysisJob, EnginePool};

fn jobs(count: usize) -> Vec<AnalysisJob> {
    (0..count)
        .map(|ply| AnalysisJob {
            ply: ply as u32,
            sfen: "startpos".into(),
            moves: vec!["7g7f".to_string(); ply],
            time_ms: 100,
            depth: None,
            node_id: None,
            generation: 1,
        })
        .collect()
}

#[test]
fn every_job_runs_exactly_once() {
    init_logger();
    let script = FakeEngineScript::default().delay(Duration::from_millis(5));
    let pool = EnginePool::new(3, script.factory()).unwrap();
    assert_eq!(script.created.load(Ordering::SeqCst), 3);

    let (tx, rx) = unbounded();
    pool.start(jobs(7), move |event| {
        let _ = tx.send(event);
    })
    .unwrap();
    pool.wait();

    let events: Vec<AnalysisEvent> = rx.try_iter().collect();
    let mut seen: HashMap<u32, usize> = HashMap::new();
    for event in &events {
        if let AnalysisEvent::Result { ply, .. } = event {
            *seen.entry(*ply).or_default() += 1;
        }
    }
    assert_eq!(seen.len(), 7);
    assert!(seen.values().all(|&n| n == 1));
    assert_eq!(
        events.last(),
        Some(&AnalysisEvent::Complete {
            completed: 7,
            total: 7,
            cancelled: false
        })
    );
    assert_eq!(script.searches.load(Ordering::SeqCst), 7);
    assert!(!pool.is_running());
}

#[test]
fn cancel_stops_the_batch() {
    init_logger();
    let script = FakeEngineScript::default().delay(Duration::from_millis(150));
    let pool = EnginePool::new(2, script.factory()).unwrap();

    let (tx, rx) = unbounded();
    pool.start(jobs(5), move |event| {
        let _ = tx.send(event);
    })
    .unwrap();

    let mut results = 0;
    while results < 2 {
        if let AnalysisEvent::Result { .. } = rx.recv_timeout(T_ENGINE).unwrap() {
            results += 1;
        }
    }
    pool.cancel();
    pool.wait();

    let rest: Vec<AnalysisEvent> = rx.try_iter().collect();
    assert!(rest.iter().all(|e| !matches!(e, AnalysisEvent::Result { .. })));
    let completes: Vec<_> = rest
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::Complete { .. }))
        .collect();
    assert_eq!(completes.len(), 1);
    assert!(matches!(
        completes[0],
        AnalysisEvent::Complete { completed: 2, total: 5, cancelled: true }
    ));
    assert!(script.searches.load(Ordering::SeqCst) < 5);
}

#[test]
fn second_batch_is_refused_while_running() {
    init_logger();
    let script = FakeEngineScript::default().delay(Duration::from_millis(50));
    let pool = EnginePool::new(1, script.factory()).unwrap();
    pool.start(jobs(2), |_| {}).unwrap();
    assert!(pool.start(jobs(1), |_| {}).is_err());
    pool.wait();
    pool.start(jobs(1), |_| {}).unwrap();
    pool.wait();
}

#[test]
fn failed_search_is_reported_and_engine_recycled() {
    init_logger();
    let mut script = FakeEngineScript::default();
    script.fail_plies.insert(1);
    let pool = EnginePool::new(1, script.factory()).unwrap();

    let (tx, rx) = unbounded();
    pool.start(jobs(3), move |event| {
        let _ = tx.send(event);
    })
    .unwrap();
    pool.wait();

    let events: Vec<AnalysisEvent> = rx.try_iter().collect();
    let errors = events
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::Error { ply: 1, .. }))
        .count();
    let results = events
        .iter()
        .filter(|e| matches!(e, AnalysisEvent::Result { .. }))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(results, 2);
    // 失敗したワーカーのエンジンは作り直される
    assert_eq!(script.created.load(Ordering::SeqCst), 2);
}

#[test]
fn next_batch_can_start_from_complete() {
    init_logger();
    let script = FakeEngineScript::default();
    let pool = Arc::new(EnginePool::new(2, script.factory()).unwrap());

    let (tx, rx) = unbounded();
    let weak = Arc::downgrade(&pool);
    let follow_tx = tx.clone();
    pool.start(jobs(2), move |event| {
        let restart = matches!(event, AnalysisEvent::Complete { .. });
        let _ = tx.send(event);
        if restart {
            if let Some(pool) = weak.upgrade() {
                let follow_tx = follow_tx.clone();
                pool.start(jobs(3), move |event| {
                    let _ = follow_tx.send(event);
                })
                .unwrap();
            }
        }
    })
    .unwrap();

    let mut completes = Vec::new();
    while completes.len() < 2 {
        if let AnalysisEvent::Complete { total, .. } = rx.recv_timeout(T_ENGINE).unwrap() {
            completes.push(total);
        }
    }
    pool.wait();
    assert_eq!(completes, vec![2, 3]);
    assert_eq!(script.searches.load(Ordering::SeqCst), 5);
    assert!(!pool.is_running());
}
