//! End-to-end: a pool playing a pair tournament between two scripted
//! engines that answer every `go` with a canned move.

#![cfg(unix)]

use std::path::PathBuf;
use std::sync::Arc;

use calipers::engine::config::EngineConfig;
use calipers::game::GameEndCause;
use calipers::openings::Openings;
use calipers::play::manager::ManagerSettings;
use calipers::play::pool::GameManagerPool;
use calipers::play::task::TaskProvider;
use calipers::time::TimeControl;
use calipers::tourney::pair::{PairSettings, PairTournament};

/// A minimal UCI engine in shell: it indexes a fixed move list with the ply
/// count of the received position, so it can play either color.
fn scripted_mover(moves: &str) -> String {
    format!(
        r#"
MOVES="{moves}"
pos=""
while read line; do
  set -- $line
  case "$1" in
    uci) echo "uciok";;
    isready) echo "readyok";;
    position) pos="$*";;
    go)
      n=0; past=0
      for w in $pos; do
        if [ "$past" = "1" ]; then n=$((n+1)); fi
        if [ "$w" = "moves" ]; then past=1; fi
      done
      i=0
      for m in $MOVES; do
        if [ "$i" = "$n" ]; then echo "bestmove $m"; break; fi
        i=$((i+1))
      done;;
    quit) exit 0;;
  esac
done
"#
    )
}

fn engine_config(name: &str, script: &str) -> EngineConfig {
    EngineConfig {
        name: name.to_string(),
        executable: PathBuf::from("/bin/sh"),
        args: vec!["-c".to_string(), script.to_string()],
        tc: TimeControl::fixed_movetime(1000),
        ..EngineConfig::default()
    }
}

#[test]
fn a_pool_plays_a_pair_tournament_to_completion() {
    // Both engines shuffle knights, so every game is drawn by repetition.
    let script = scripted_mover("g1f3 g8f6 f3g1 f6g8 g1f3 g8f6 f3g1 f6g8");
    let alpha = engine_config("pool-alpha", &script);
    let beta = engine_config("pool-beta", &script);
    let pair = Arc::new(PairTournament::new(
        &alpha.name,
        &beta.name,
        PairSettings {
            games: 4,
            repeat: 2,
            swap_colors: true,
            round: 1,
        },
        Arc::new(Openings::startpos_only()),
    ));

    let pool = GameManagerPool::new(2, ManagerSettings::default());
    pool.add_task_provider(
        pair.clone() as Arc<dyn TaskProvider>,
        alpha,
        Some(beta),
        2,
    )
    .unwrap();
    pool.wait_for_tasks().unwrap();

    assert!(pair.is_finished());
    assert_eq!(pair.wdl(), (0, 4, 0));
    let duel = pair.duel();
    assert_eq!(duel.cause_stats[&GameEndCause::Repetition].draws, 4);
    assert!(pair.result_string().ends_with(": ===="));
}

#[test]
fn a_match_between_unequal_scripts_counts_engine_a_relative() {
    // Whoever has the white pieces mates with the scholar's line; the
    // pairing swaps colors, so the two games split 1-1.
    let script = scripted_mover("e2e4 e7e5 d1h5 b8c6 f1c4 g8f6 h5f7");
    let alpha = engine_config("swap-alpha", &script);
    let beta = engine_config("swap-beta", &script);
    let pair = Arc::new(PairTournament::new(
        &alpha.name,
        &beta.name,
        PairSettings {
            games: 2,
            repeat: 2,
            swap_colors: true,
            round: 1,
        },
        Arc::new(Openings::startpos_only()),
    ));
    let pool = GameManagerPool::new(1, ManagerSettings::default());
    pool.add_task_provider(pair.clone() as Arc<dyn TaskProvider>, alpha, Some(beta), 1)
        .unwrap();
    pool.wait_for_tasks().unwrap();

    assert!(pair.is_finished());
    assert_eq!(pair.wdl(), (1, 0, 1));
    assert_eq!(pair.duel().cause_stats[&GameEndCause::Checkmate].wins, 1);
    assert_eq!(pair.duel().cause_stats[&GameEndCause::Checkmate].losses, 1);
}
