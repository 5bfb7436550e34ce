use std::process::exit;
use std::sync::Arc;

use calipers::cli::{self, CommandLineArgs};
use calipers::engine::config::{EngineConfig, EngineConfigManager};
use calipers::epd::{read_epd_file, EpdSuite};
use calipers::logger::{self, Message};
use calipers::openings::Openings;
use calipers::pgn::{PgnOptions, PgnWriter};
use calipers::play::manager::ManagerSettings;
use calipers::play::pool::GameManagerPool;
use calipers::play::task::TaskProvider;
use calipers::tourney::gauntlet::GauntletTournament;
use calipers::tourney::pair::{self, PairSettings, PairTournament};
use calipers::tourney::sprt::SprtRun;
use calipers::{AppReturnCode, Res};

fn main() {
    let code = match run_program() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err}");
            AppReturnCode::ConfigError
        }
    };
    logger::teardown();
    exit(code.exit_code());
}

fn run_program() -> Res<AppReturnCode> {
    let args = cli::parse_cli()?;
    logger::init(args.log_file.as_deref(), args.debug)?;

    let configs = collect_engine_configs(&args)?;
    if configs.is_empty() {
        anyhow::bail!("No engines configured. Use -engine cmd=... (or -help)")
    }

    let openings = Arc::new(match &args.openings {
        Some(book) => Openings::from_file(
            &book.file,
            book.format,
            book.order,
            book.start,
            book.seed,
            book.plies,
        )?,
        None => Openings::startpos_only(),
    });
    let settings = ManagerSettings {
        max_plies: args.max_moves.map(|moves| moves * 2),
        pgn: args
            .pgn_out
            .as_ref()
            .map(|path| Arc::new(PgnWriter::new(path.clone(), PgnOptions::default()))),
        event: args.event.clone().unwrap_or_else(|| "calipers match".to_string()),
        site: args.site.clone().unwrap_or_default(),
    };
    let pool = GameManagerPool::new(args.concurrency, settings);

    let run = schedule(&args, &pool, configs, openings)?;
    let run_result = pool.wait_for_tasks();
    if let Some(path) = &args.result_file {
        if !run.pairs.is_empty() {
            pair::save_tournaments(path, &run.pairs)?;
        }
    }
    run_result?;

    for pair in &run.pairs {
        logger::log(Message::Info, &pair.result_string());
        logger::log(Message::Info, &pair.duel().to_string());
    }
    for suite in &run.suites {
        logger::log(Message::Info, &suite.summary());
    }
    let mut code = AppReturnCode::NoError;
    for report in pool.reports() {
        code = code.combine(report.log_summary());
    }
    Ok(code)
}

fn collect_engine_configs(args: &CommandLineArgs) -> Res<Vec<EngineConfig>> {
    let manager = EngineConfigManager::default();
    if let Some(path) = &args.config_file {
        manager.load(path)?;
    }
    for engine in &args.engines {
        _ = manager.add(cli::build_engine_config(engine.clone(), &args.each)?);
    }
    Ok(manager.all())
}

/// What `schedule` set up, kept around for result printing and persistence.
#[derive(Default)]
struct ScheduledRun {
    pairs: Vec<Arc<PairTournament>>,
    suites: Vec<Arc<EpdSuite>>,
}

/// Restores persisted pair results before any manager starts pulling tasks.
fn restore_results(args: &CommandLineArgs, pairs: &[Arc<PairTournament>]) -> Res<()> {
    if let Some(path) = &args.result_file {
        if path.is_file() {
            pair::load_tournaments(path, pairs)?;
        }
    }
    Ok(())
}

/// Builds the providers for the requested mode and registers them with the
/// pool.
fn schedule(
    args: &CommandLineArgs,
    pool: &GameManagerPool,
    configs: Vec<EngineConfig>,
    openings: Arc<Openings>,
) -> Res<ScheduledRun> {
    let mut run = ScheduledRun::default();
    if let Some(epd_path) = &args.epd {
        let positions = read_epd_file(epd_path)?;
        let per_engine = (args.concurrency / configs.len()).max(1);
        for config in &configs {
            // every engine runs the whole suite with its own tally
            let suite = Arc::new(EpdSuite::new(
                &format!("{} ({})", epd_path.display(), config.name),
                positions.clone(),
                args.epd_movetime_ms,
            ));
            pool.add_task_provider(
                suite.clone() as Arc<dyn TaskProvider>,
                config.clone(),
                None,
                per_engine,
            )?;
            run.suites.push(suite);
        }
        return Ok(run);
    }

    let pair_settings = PairSettings {
        games: args.games,
        repeat: args.repeat.max(1),
        swap_colors: args.swap_colors,
        round: 1,
    };

    let gauntlet_requested = args.gauntlet || configs.iter().any(|c| c.gauntlet);
    if gauntlet_requested && configs.len() > 2 {
        let hero_idx = configs.iter().position(|c| c.gauntlet).unwrap_or(0);
        let mut configs = configs;
        let hero = configs.remove(hero_idx);
        let gauntlet = GauntletTournament::new(hero, configs, pair_settings, openings)?;
        restore_results(args, gauntlet.pairs())?;
        let per_pair = (args.concurrency / gauntlet.pairs().len()).max(1);
        gauntlet.add_to_pool(pool, per_pair)?;
        run.pairs = gauntlet.pairs().to_vec();
        return Ok(run);
    }

    if configs.len() != 2 {
        anyhow::bail!(
            "A match needs exactly two engines (got {}); use -gauntlet for more",
            configs.len()
        )
    }
    let pair = Arc::new(PairTournament::new(
        &configs[0].name,
        &configs[1].name,
        pair_settings,
        openings,
    ));
    restore_results(args, std::slice::from_ref(&pair))?;
    let provider: Arc<dyn TaskProvider> = match &args.sprt {
        Some(sprt) => Arc::new(SprtRun::new(pair.clone(), *sprt)),
        None => pair.clone(),
    };
    pool.add_task_provider(
        provider,
        configs[0].clone(),
        Some(configs[1].clone()),
        args.concurrency,
    )?;
    run.pairs = vec![pair];
    Ok(run)
}
