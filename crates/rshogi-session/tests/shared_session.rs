//! 共有シーケンサの結合テスト

mod common;

use std::thread;
use std::time::Duration;

use common::*;
use crossbeam_channel::bounded;
use rshogi_session::config::PassRuleConfig;
use rshogi_session::{Color, SessionConfig, SharedSession};

fn shared_after_one_move() -> SharedSession {
    let config = SessionConfig {
        pass: PassRuleConfig {
            enabled: true,
            sente: 1,
            gote: 1,
        },
        ..SessionConfig::default()
    };
    let (mut session, _, _) = session_with(config);
    session.start_match().unwrap();
    session.apply_usi("7g7f").unwrap();
    SharedSession::new(session)
}

fn current_ply(shared: &SharedSession) -> u32 {
    shared.with(|s| s.tree().current_node().ply)
}

#[test]
fn overlapping_undo_and_pass_are_ignored() {
    let shared = shared_after_one_move();
    let (entered_tx, entered_rx) = bounded(0);
    let (release_tx, release_rx) = bounded::<()>(0);

    let worker = {
        let shared = shared.clone();
        thread::spawn(move || {
            shared
                .try_run("move", |session| {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    session.apply_usi("3c3d")
                })
                .unwrap()
        })
    };
    entered_rx.recv_timeout(T_ENGINE).unwrap();

    assert!(shared.try_undo().unwrap().is_ignored());
    assert!(shared.try_pass().unwrap().is_ignored());

    release_tx.send(()).unwrap();
    let first = worker.join().unwrap();
    assert!(!first.is_ignored());
    assert_eq!(current_ply(&shared), 2);
    // 読み捨てたパスは権利を消費しない
    assert_eq!(shared.with(|s| s.remaining_pass_rights(Color::Black)), Some(1));

    // 処理が終われば受け付ける
    let undone = shared.try_undo().unwrap();
    assert!(!undone.is_ignored());
    assert_eq!(current_ply(&shared), 0);
}

#[test]
fn readers_do_not_drop_undo() {
    let shared = shared_after_one_move();
    let (held_tx, held_rx) = bounded(0);

    let reader = {
        let shared = shared.clone();
        thread::spawn(move || {
            shared.with(|s| {
                held_tx.send(()).unwrap();
                let _ = s.clock_snapshot();
                thread::sleep(Duration::from_millis(100));
            })
        })
    };
    held_rx.recv_timeout(T_ENGINE).unwrap();

    let outcome = shared.try_undo().unwrap();
    assert!(!outcome.is_ignored());
    reader.join().unwrap();
    assert_eq!(current_ply(&shared), 0);
}
