use std::collections::BTreeMap;
use std::iter::Peekable;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use itertools::Itertools;

use crate::engine::adapter::Protocol;
use crate::engine::config::EngineConfig;
use crate::openings::{OpeningFormat, OpeningOrder};
use crate::time::TimeControl;
use crate::tourney::sprt::SprtConfig;
use crate::util::{parse_fp_from_str, parse_int_from_str, Res};

/// Since the usual argument crates don't handle long options with a single
/// `-` (the cutechess convention engine testers follow), the parser is
/// written by hand.
pub type ArgIter = Peekable<std::vec::IntoIter<String>>;

/// One `-engine`/`-each` argument group, merged and turned into an
/// [`EngineConfig`] later.
#[derive(Debug, Default, Clone)]
pub struct EngineCliArgs {
    pub name: Option<String>,
    pub cmd: Option<String>,
    pub dir: Option<PathBuf>,
    pub args: Vec<String>,
    pub proto: Option<Protocol>,
    pub tc: Option<TimeControl>,
    pub movetime_ms: Option<u64>,
    pub depth: Option<u32>,
    pub nodes: Option<u64>,
    pub ponder: bool,
    pub gauntlet: bool,
    pub stderr: Option<PathBuf>,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct OpeningsCliArgs {
    pub file: PathBuf,
    pub format: OpeningFormat,
    pub order: OpeningOrder,
    pub start: usize,
    pub plies: usize,
    pub seed: u64,
}

#[derive(Debug, Default)]
pub struct CommandLineArgs {
    pub engines: Vec<EngineCliArgs>,
    pub each: EngineCliArgs,
    pub concurrency: usize,
    pub games: usize,
    pub repeat: usize,
    pub swap_colors: bool,
    pub sprt: Option<SprtConfig>,
    pub openings: Option<OpeningsCliArgs>,
    /// Run an EPD conformance suite instead of games.
    pub epd: Option<PathBuf>,
    pub epd_movetime_ms: u64,
    pub gauntlet: bool,
    pub pgn_out: Option<PathBuf>,
    pub result_file: Option<PathBuf>,
    pub config_file: Option<PathBuf>,
    pub max_moves: Option<usize>,
    pub event: Option<String>,
    pub site: Option<String>,
    pub log_file: Option<PathBuf>,
    pub debug: bool,
}

impl CommandLineArgs {
    fn new() -> Self {
        Self {
            concurrency: 1,
            games: 2,
            repeat: 2,
            swap_colors: true,
            epd_movetime_ms: 5000,
            ..Self::default()
        }
    }
}

fn parse_key_equals_value(arg: &str) -> Res<(&str, Res<&str>)> {
    let mut parts = arg.splitn(2, '=');
    let key = parts.next().unwrap();
    let value = parts
        .next()
        .ok_or_else(|| anyhow!("Expected '=<value>' after '{key}'"));
    Ok((key, value))
}

/// Parses one `-engine` (or `-each`) group: `key=value` arguments up to the
/// next option.
pub fn parse_engine_group(args: &mut ArgIter) -> Res<EngineCliArgs> {
    let mut res = EngineCliArgs::default();
    while let Some(arg) = args.peek() {
        if arg.starts_with('-') {
            return Ok(res);
        }
        let arg = args.next().unwrap();
        let (key, value) = parse_key_equals_value(&arg)?;
        match key {
            "name" => res.name = Some(value?.to_string()),
            "cmd" => res.cmd = Some(value?.to_string()),
            "dir" => res.dir = Some(PathBuf::from(value?)),
            "arg" => res.args.push(value?.to_string()),
            "proto" => {
                let value = value?;
                res.proto = Some(Protocol::from_str(value).map_err(|_| {
                    anyhow!("Unrecognized protocol '{}'; use 'uci' or 'xboard'", value)
                })?);
            }
            "tc" => res.tc = Some(TimeControl::from_str(value?)?),
            "st" => {
                let seconds: f64 = parse_fp_from_str(value?, "st (seconds per move)")?;
                res.movetime_ms = Some((seconds * 1000.0).round() as u64);
            }
            "depth" => res.depth = Some(parse_int_from_str(value?, "depth")?),
            "nodes" => res.nodes = Some(parse_int_from_str(value?, "nodes")?),
            "ponder" => res.ponder = true,
            "gauntlet" => res.gauntlet = true,
            "stderr" => res.stderr = Some(PathBuf::from(value?)),
            key => match key.strip_prefix("option.") {
                Some(option) => {
                    _ = res.options.insert(option.to_string(), value?.to_string());
                }
                None => bail!("Unknown engine setting '{key}'"),
            },
        }
    }
    Ok(res)
}

fn parse_sprt_group(args: &mut ArgIter) -> Res<SprtConfig> {
    let mut res = SprtConfig::default();
    while let Some(arg) = args.peek() {
        if arg.starts_with('-') {
            break;
        }
        let arg = args.next().unwrap();
        let (key, value) = parse_key_equals_value(&arg)?;
        match key {
            "elo0" => res.elo_lower = parse_fp_from_str(value?, "elo0")?,
            "elo1" => res.elo_upper = parse_fp_from_str(value?, "elo1")?,
            "alpha" => res.alpha = parse_fp_from_str(value?, "alpha")?,
            "beta" => res.beta = parse_fp_from_str(value?, "beta")?,
            key => bail!("Unknown sprt setting '{key}'"),
        }
    }
    if res.elo_upper <= res.elo_lower {
        bail!("sprt needs elo1 > elo0")
    }
    if !(0.0..0.5).contains(&res.alpha) || !(0.0..0.5).contains(&res.beta) {
        bail!("sprt error rates must lie in (0, 0.5)")
    }
    Ok(res)
}

fn parse_openings_group(args: &mut ArgIter) -> Res<OpeningsCliArgs> {
    let mut file = None;
    let mut format = OpeningFormat::Epd;
    let mut order = OpeningOrder::Sequential;
    let mut start = 0_usize;
    let mut plies = 8_usize;
    let mut seed = 0_u64;
    while let Some(arg) = args.peek() {
        if arg.starts_with('-') {
            break;
        }
        let arg = args.next().unwrap();
        let (key, value) = parse_key_equals_value(&arg)?;
        match key {
            "file" => file = Some(PathBuf::from(value?)),
            "format" => {
                format = OpeningFormat::from_str(value?)
                    .map_err(|_| anyhow!("Unknown opening format; use epd, raw or pgn"))?;
            }
            "order" => {
                order = OpeningOrder::from_str(value?)
                    .map_err(|_| anyhow!("Unknown opening order; use sequential or random"))?;
            }
            "start" => start = parse_int_from_str(value?, "start")?,
            "plies" => plies = parse_int_from_str(value?, "plies")?,
            "srand" | "seed" => seed = parse_int_from_str(value?, "seed")?,
            key => bail!("Unknown openings setting '{key}'"),
        }
    }
    Ok(OpeningsCliArgs {
        file: file.ok_or_else(|| anyhow!("-openings needs file=<path>"))?,
        format,
        order,
        start,
        plies,
        seed,
    })
}

fn get_next_arg(args: &mut ArgIter, name: &str) -> Res<String> {
    args.next()
        .ok_or_else(|| anyhow!("Missing value after '-{name}'"))
}

pub const USAGE: &str = "usage: calipers [options]
  -engine name=N cmd=PATH [dir=D] [proto=uci|xboard] [tc=40/60+0.5] [st=S]
          [depth=N] [nodes=N] [ponder] [gauntlet] [option.NAME=VALUE]...
  -each KEY=VALUE...         defaults applied to every engine
  -conf FILE                 load engine configurations from FILE
  -concurrency N             number of games run in parallel
  -games N                   games per pairing
  -repeat N                  consecutive games per opening
  -noswap                    don't alternate colors
  -openings file=F [format=epd|raw|pgn] [order=sequential|random]
            [start=N] [plies=N] [seed=N]
  -sprt elo0=E0 elo1=E1 [alpha=A] [beta=B]
  -epd FILE                  run an EPD suite instead of games
  -st-epd S                  seconds per EPD position
  -gauntlet                  first engine plays every other engine
  -maxmoves N                adjudicate longer games as draws
  -pgnout FILE               append finished games to FILE
  -resultfile FILE           persist and resume pair results
  -event NAME  -site NAME    PGN tags
  -log FILE  -debug          logging
";

/// Parses the given argument list (without the program name).
pub fn parse_args(argv: Vec<String>) -> Res<CommandLineArgs> {
    let mut args: ArgIter = argv.into_iter().peekable();
    let mut res = CommandLineArgs::new();
    while let Some(mut arg) = args.next() {
        // accept '--long' for people who can't let go of the double dash
        if arg.starts_with("--") {
            _ = arg.remove(0);
        }
        match arg.as_str() {
            "-h" | "-help" => bail!("{USAGE}"),
            "-engine" => res.engines.push(parse_engine_group(&mut args)?),
            "-each" => res.each = parse_engine_group(&mut args)?,
            "-conf" => res.config_file = Some(PathBuf::from(get_next_arg(&mut args, "conf")?)),
            "-concurrency" => {
                res.concurrency = parse_int_from_str(&get_next_arg(&mut args, "concurrency")?, "concurrency")?;
            }
            "-games" => {
                res.games = parse_int_from_str(&get_next_arg(&mut args, "games")?, "games")?;
            }
            "-repeat" => {
                res.repeat = parse_int_from_str(&get_next_arg(&mut args, "repeat")?, "repeat")?;
            }
            "-noswap" => res.swap_colors = false,
            "-sprt" => res.sprt = Some(parse_sprt_group(&mut args)?),
            "-openings" => res.openings = Some(parse_openings_group(&mut args)?),
            "-epd" => res.epd = Some(PathBuf::from(get_next_arg(&mut args, "epd")?)),
            "-st-epd" => {
                let seconds: f64 =
                    parse_fp_from_str(&get_next_arg(&mut args, "st-epd")?, "st-epd")?;
                res.epd_movetime_ms = (seconds * 1000.0).round() as u64;
            }
            "-gauntlet" => res.gauntlet = true,
            "-maxmoves" => {
                res.max_moves = Some(parse_int_from_str(&get_next_arg(&mut args, "maxmoves")?, "maxmoves")?);
            }
            "-pgnout" => res.pgn_out = Some(PathBuf::from(get_next_arg(&mut args, "pgnout")?)),
            "-resultfile" => {
                res.result_file = Some(PathBuf::from(get_next_arg(&mut args, "resultfile")?));
            }
            "-event" => res.event = Some(get_next_arg(&mut args, "event")?),
            "-site" => res.site = Some(get_next_arg(&mut args, "site")?),
            "-log" => res.log_file = Some(PathBuf::from(get_next_arg(&mut args, "log")?)),
            "-d" | "-debug" => res.debug = true,
            x => bail!("Unrecognized option '{x}'. Use -help for the list of options"),
        }
    }
    if res.concurrency == 0 {
        bail!("-concurrency must be at least 1")
    }
    Ok(res)
}

pub fn parse_cli() -> Res<CommandLineArgs> {
    parse_args(std::env::args().skip(1).collect_vec())
}

/// Applies `-each` defaults to one engine group. Options the engine sets
/// itself win.
pub fn combine_engine_args(engine: &mut EngineCliArgs, each: &EngineCliArgs) {
    engine.name = engine.name.take().or_else(|| each.name.clone());
    engine.cmd = engine.cmd.take().or_else(|| each.cmd.clone());
    engine.dir = engine.dir.take().or_else(|| each.dir.clone());
    if engine.args.is_empty() {
        engine.args = each.args.clone();
    }
    engine.proto = engine.proto.or(each.proto);
    engine.tc = engine.tc.take().or_else(|| each.tc.clone());
    engine.movetime_ms = engine.movetime_ms.or(each.movetime_ms);
    engine.depth = engine.depth.or(each.depth);
    engine.nodes = engine.nodes.or(each.nodes);
    engine.ponder |= each.ponder;
    engine.stderr = engine.stderr.take().or_else(|| each.stderr.clone());
    for (key, value) in &each.options {
        _ = engine
            .options
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

/// Turns a merged CLI group into a finalized engine configuration.
pub fn build_engine_config(mut engine: EngineCliArgs, each: &EngineCliArgs) -> Res<EngineConfig> {
    combine_engine_args(&mut engine, each);
    let mut tc = engine.tc.unwrap_or_default();
    if let Some(movetime) = engine.movetime_ms {
        tc.movetime_ms = Some(movetime);
    }
    if let Some(depth) = engine.depth {
        tc.depth = Some(depth);
    }
    if let Some(nodes) = engine.nodes {
        tc.nodes = Some(nodes);
    }
    if tc.limit_count() == 0 && !tc.infinite {
        // an unbounded 'go' would never return; give unconfigured engines a
        // small default clock
        tc = TimeControl::sudden_death(2000, 400);
    }
    EngineConfig {
        name: engine.name.unwrap_or_default(),
        executable: PathBuf::from(engine.cmd.unwrap_or_default()),
        working_dir: engine.dir,
        args: engine.args,
        protocol: engine.proto.unwrap_or_default(),
        ponder: engine.ponder,
        gauntlet: engine.gauntlet,
        tc,
        options: engine.options,
        stderr_file: engine.stderr,
    }
    .finalize()
}
