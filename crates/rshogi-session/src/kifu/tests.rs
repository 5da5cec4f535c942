use super::*;
use crate::error::SessionError;
use crate::position::Position;
use crate::types::{Color, EvalEvent, Score};

fn pos(ply: u32) -> Position {
    Position::empty(Color::after_plies(Color::Black, ply), ply)
}

fn tree() -> KifuTree {
    KifuTree::new(pos(0), "startpos")
}

/// 現在ノードに `moves` を順に追加する
fn play(tree: &mut KifuTree, moves: &[&str]) -> Vec<NodeId> {
    moves
        .iter()
        .map(|mv| {
            let ply = tree.current_node().ply + 1;
            tree.add_move(mv, pos(ply), NodeMeta::default()).unwrap().node_id
        })
        .collect()
}

fn moves_of(tree: &KifuTree, line: &[NodeId]) -> Vec<String> {
    line.iter().filter_map(|id| tree.node(*id).unwrap().usi_move.clone()).collect()
}

#[test]
fn test_add_move_builds_main_line() {
    let mut t = tree();
    let ids = play(&mut t, &["7g7f", "3c3d", "2g2f"]);
    assert_eq!(t.current_id(), ids[2]);
    assert_eq!(t.current_node().ply, 3);
    assert_eq!(t.main_line_moves(), vec!["7g7f", "3c3d", "2g2f"]);
    assert_eq!(t.record().to_notation(), "startpos moves 7g7f 3c3d 2g2f");
}

#[test]
fn test_start_then_end_returns_to_same_node() {
    let mut t = tree();
    let ids = play(&mut t, &["7g7f", "3c3d", "2g2f", "8c8d"]);
    t.go_to_start();
    assert_eq!(t.current_id(), t.root_id());
    t.go_to_end();
    assert_eq!(t.current_id(), ids[3]);

    t.go_to_start();
    for (n, id) in ids.iter().enumerate() {
        assert!(t.go_forward(None).unwrap(), "forward #{n}");
        assert_eq!(t.current_id(), *id);
    }
    assert!(!t.go_forward(None).unwrap());
}

#[test]
fn test_re_adding_same_move_is_idempotent() {
    let mut t = tree();
    let ids = play(&mut t, &["7g7f"]);
    t.go_back();
    let outcome = t.add_move("7g7f", pos(1), NodeMeta::default()).unwrap();
    assert!(!outcome.created);
    assert!(outcome.branch.is_none());
    assert_eq!(outcome.node_id, ids[0]);
    assert_eq!(t.root().children.len(), 1);
    assert_eq!(t.len(), 2);
}

#[test]
fn test_new_sibling_reports_branch_once() {
    let mut t = tree();
    play(&mut t, &["7g7f", "3c3d"]);
    t.go_back();
    let outcome = t.add_move("8c8d", pos(2), NodeMeta::default()).unwrap();
    let branch = outcome.branch.expect("branch");
    assert_eq!(branch.ply, 2);
    assert_eq!(branch.first_move, "8c8d");

    // 分岐上での続きは分岐作成ではない
    let cont = t.add_move("2g2f", pos(3), NodeMeta::default()).unwrap();
    assert!(cont.created && cont.branch.is_none());

    // 同じ分岐をもう一度指しても報告しない
    t.go_back();
    t.go_back();
    let again = t.add_move("8c8d", pos(2), NodeMeta::default()).unwrap();
    assert!(again.branch.is_none());
}

#[test]
fn test_invalid_token_leaves_tree_untouched() {
    let mut t = tree();
    play(&mut t, &["7g7f"]);
    let before = t.current_id();
    let err = t.add_move("7g7z", pos(2), NodeMeta::default()).unwrap_err();
    assert!(matches!(err, SessionError::Record(_)));
    assert_eq!(t.current_id(), before);
    assert_eq!(t.len(), 2);
}

#[test]
fn test_tokens_are_normalized() {
    let mut t = tree();
    t.add_move("0000", pos(1), NodeMeta::default()).unwrap();
    assert_eq!(t.current_node().usi_move.as_deref(), Some("none"));
    t.add_move("P*5e", pos(2), NodeMeta::elapsed(1200)).unwrap();
    assert_eq!(t.current_node().elapsed_ms, Some(1200));
    assert_eq!(t.current_node().mover(), Some(Color::White));
}

#[test]
fn test_switch_branch_then_promote() {
    // root → A → B（本譜）, root → A → C（分岐）
    let mut t = tree();
    let ab = play(&mut t, &["7g7f", "3c3d"]);
    t.go_back();
    let c = play(&mut t, &["8c8d"])[0];
    t.go_to_node(ab[1]).unwrap();

    assert!(t.switch_branch(1));
    assert_eq!(t.current_id(), c);
    // 表示の切り替えだけでは本譜は変わらない
    assert_eq!(t.node(ab[0]).unwrap().children[0], ab[1]);

    assert!(t.promote_current_line());
    let a = t.node(ab[0]).unwrap();
    assert_eq!(a.children, vec![c, ab[1]]);
    assert_eq!(t.main_line_moves(), vec!["7g7f", "8c8d"]);
}

#[test]
fn test_promote_makes_current_line_main_end_to_end() {
    let mut t = tree();
    let main = play(&mut t, &["7g7f", "3c3d", "2g2f"]);
    t.go_to_start();
    let side = play(&mut t, &["2g2f", "8c8d", "7g7f"]);
    assert!(t.promote_current_line());

    t.go_to_start();
    let mut walked = Vec::new();
    for _ in 0..3 {
        assert!(t.go_forward(None).unwrap());
        walked.push(t.current_id());
    }
    assert_eq!(walked, side);
    // 元の本譜は分岐点で 2 番目になる
    assert_eq!(t.root().children, vec![side[0], main[0]]);
    assert!(!t.promote_current_line());
}

#[test]
fn test_switch_branch_clamps_and_keeps_ply() {
    let mut t = tree();
    let main = play(&mut t, &["7g7f", "3c3d", "2g2f"]);
    t.go_to_start();
    let second = play(&mut t, &["2g2f", "8c8d", "7g7f"]);
    t.go_to_node(main[2]).unwrap();

    // 分岐点は根。手数 3 まで先頭の子を辿る
    assert!(t.switch_branch(5));
    assert_eq!(t.current_id(), second[2]);
    assert!(!t.switch_branch(1));
    assert!(t.switch_branch(-9));
    assert_eq!(t.current_id(), main[2]);
}

#[test]
fn test_switch_branch_without_siblings_is_noop() {
    let mut t = tree();
    play(&mut t, &["7g7f", "3c3d"]);
    let before = t.current_id();
    assert!(!t.switch_branch(1));
    assert_eq!(t.current_id(), before);
}

#[test]
fn test_switch_branch_at_node() {
    let mut t = tree();
    let a = play(&mut t, &["7g7f"])[0];
    t.go_to_start();
    let b = play(&mut t, &["2g2f"])[0];
    let root = t.root_id();
    assert!(t.switch_branch_at_node(root, 0).unwrap());
    assert_eq!(t.current_id(), a);
    assert!(t.switch_branch_at_node(root, 1).unwrap());
    assert_eq!(t.current_id(), b);
    assert!(!t.switch_branch_at_node(root, 2).unwrap());
}

#[test]
fn test_go_to_ply_follows_current_line() {
    let mut t = tree();
    let main = play(&mut t, &["7g7f", "3c3d", "2g2f"]);
    t.go_to_node(main[0]).unwrap();
    t.go_to_ply(3).unwrap();
    assert_eq!(t.current_id(), main[2]);
    t.go_to_ply(1).unwrap();
    assert_eq!(t.current_id(), main[0]);
    assert_eq!(t.go_to_ply(7), Err(SessionError::NoSuchPly(7)));
    assert_eq!(t.current_id(), main[0]);
}

#[test]
fn test_unknown_node_is_reported_not_panicking() {
    let mut t = tree();
    let ids = play(&mut t, &["7g7f"]);
    t.reset(pos(0), "startpos");
    assert_eq!(t.go_to_node(ids[0]), Err(SessionError::UnknownNode(ids[0])));
    assert_eq!(
        t.record_eval_by_node_id(ids[0], &EvalEvent::cp(10, 5)),
        Err(SessionError::UnknownNode(ids[0]))
    );
    assert!(t.go_forward(Some(ids[0])).is_err());
    assert_eq!(t.current_id(), t.root_id());
}

#[test]
fn test_reset_advances_generation_and_never_reuses_ids() {
    let mut t = tree();
    let first = play(&mut t, &["7g7f"]);
    let generation = t.generation();
    t.reset(pos(0), "startpos");
    assert_eq!(t.generation(), generation + 1);
    assert_eq!(t.len(), 1);
    let second = play(&mut t, &["7g7f"]);
    assert_ne!(first[0], second[0]);
}

#[test]
fn test_replaying_recorded_moves_reproduces_tree() {
    let mut t = tree();
    play(&mut t, &["7g7f", "3c3d", "2g2f", "4c4d"]);
    let record = t.record();

    let mut rebuilt = KifuTree::new(pos(0), record.start.clone());
    let moves: Vec<&str> = record.moves.iter().map(String::as_str).collect();
    play(&mut rebuilt, &moves);
    let original = t.main_line();
    let copy = rebuilt.main_line();
    assert_eq!(moves_of(&t, &original), moves_of(&rebuilt, &copy));
    let plies = |tree: &KifuTree, line: &[NodeId]| -> Vec<u32> {
        line.iter().map(|id| tree.node(*id).unwrap().ply).collect()
    };
    assert_eq!(plies(&t, &original), plies(&rebuilt, &copy));
}

#[test]
fn test_eval_is_kept_from_deeper_search() {
    let mut t = tree();
    let ids = play(&mut t, &["7g7f", "3c3d"]);
    assert!(t.record_eval_by_ply(2, &EvalEvent::cp(50, 12)).unwrap());
    assert!(!t.record_eval_by_ply(2, &EvalEvent::cp(-400, 3)).unwrap());
    assert!(t.record_eval_by_node_id(ids[1], &EvalEvent::cp(80, 12)).unwrap());

    let eval = t.node(ids[1]).unwrap().eval.clone().unwrap();
    assert_eq!(eval.score, Score::Cp(80));
    // 2 手目の後は先手番なので符号はそのまま
    assert_eq!(eval.normalized, Score::Cp(80));

    // 後手番の局面は先手視点に反転する
    t.record_eval_by_ply(1, &EvalEvent::cp(30, 8)).unwrap();
    assert_eq!(t.node(ids[0]).unwrap().eval.as_ref().unwrap().normalized, Score::Cp(-30));

    assert!(!t.record_eval_by_ply(1, &EvalEvent::default()).unwrap());
    assert_eq!(t.record_eval_by_ply(9, &EvalEvent::cp(1, 1)), Err(SessionError::NoSuchPly(9)));
}

#[test]
fn test_add_pv_as_branch_merges_and_reports_new_branch() {
    let mut t = tree();
    let main = play(&mut t, &["7g7f", "3c3d", "2g2f"]);
    t.go_to_node(main[2]).unwrap();

    let mut requested = Vec::new();
    let mut created = Vec::new();
    let pv: Vec<String> = ["3c3d", "8h2b+", "3a2b"].iter().map(|s| s.to_string()).collect();
    let first = t
        .add_pv_as_branch(
            1,
            &pv,
            |moves| {
                requested.push(moves.to_vec());
                Ok(pos(moves.len() as u32))
            },
            |b| created.push(b.clone()),
        )
        .unwrap()
        .expect("new nodes");

    // 3c3d は既存の子に合流し、8h2b+ から分岐する
    assert_eq!(requested[0], vec!["7g7f", "3c3d", "8h2b+"]);
    assert_eq!(requested.len(), 2);
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].ply, 3);
    assert_eq!(created[0].node_id, first);
    // 現在ノードと本譜は変わらない
    assert_eq!(t.current_id(), main[2]);
    assert_eq!(t.main_line_moves(), vec!["7g7f", "3c3d", "2g2f"]);
    assert_eq!(t.node(main[1]).unwrap().children.len(), 2);
}

#[test]
fn test_add_pv_as_branch_fully_matching_or_failing_inserts_nothing() {
    let mut t = tree();
    play(&mut t, &["7g7f", "3c3d"]);
    let before = t.len();
    let pv = vec!["7g7f".to_string(), "3c3d".to_string()];
    let mut called = false;
    let res = t.add_pv_as_branch(0, &pv, |_| Ok(pos(0)), |_| called = true).unwrap();
    assert!(res.is_none());
    assert!(!called);

    let pv = vec!["2g2f".to_string(), "8c8d".to_string()];
    let err = t
        .add_pv_as_branch(
            0,
            &pv,
            |moves| if moves.len() == 2 { Err("illegal".to_string()) } else { Ok(pos(1)) },
            |_| called = true,
        )
        .unwrap_err();
    assert_eq!(err, SessionError::Conversion("illegal".to_string()));
    assert_eq!(t.len(), before);
    assert!(!called);
}

#[test]
fn test_pv_extending_line_end_is_not_a_branch() {
    let mut t = tree();
    play(&mut t, &["7g7f"]);
    let mut called = false;
    let pv = vec!["3c3d".to_string()];
    let id = t.add_pv_as_branch(1, &pv, |m| Ok(pos(m.len() as u32)), |_| called = true).unwrap();
    assert!(id.is_some());
    assert!(!called);
    assert_eq!(t.main_line_moves(), vec!["7g7f", "3c3d"]);
}
