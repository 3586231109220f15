use std::process;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use evalbridge::functions::{Branin, OffsetSphere};
use evalbridge::logging::init_tracing;
use evalbridge::{
    BridgeConfig, Driver, ObjectiveFailurePolicy, Objective, ObjectiveError, OptimizerConfig,
    Problem, ProcessLauncher, RandomSearch, RunReport, ScriptedOptimizer, run_worker,
};

const USAGE: &str = "\
Usage:
  evalbridge worker [--objective offset-sphere|branin] [--crash-after N] [--fail-at N] [--hang-at N]
                    [--print-calls]
  evalbridge driver [--dims N] [--iterations N] [--init-samples N] [--seed N]
                    [--points \"x,y;x,y\"] [--response-timeout-ms N] [--retry N] [-- <worker args>]

Worker options:
  --objective <name>        Objective to serve [default: offset-sphere]
  --crash-after <n>         Exit abruptly when request n+1 arrives
  --fail-at <n>             Fail the objective on request n
  --hang-at <n>             Never answer request n
  --print-calls             Print every call to stdout, as a chatty objective would

Driver options:
  --dims <n>                Problem dimensions [default: 2, or the length of --points]
  --iterations <n>          Optimizer iterations
  --init-samples <n>        Initial samples
  --seed <n>                Random seed
  --points <list>           Evaluate exactly these points instead of random search
  --response-timeout-ms <n> Give up on a response after n milliseconds
  --retry <n>               Attempts per point when the objective fails [default: 1]

Everything after `--` is passed to the spawned worker.";

#[derive(Debug)]
enum Command {
    Worker(WorkerOptions),
    Driver(DriverOptions),
}

#[derive(Debug)]
struct WorkerOptions {
    objective: String,
    crash_after: Option<u64>,
    fail_at: Option<u64>,
    hang_at: Option<u64>,
    print_calls: bool,
}

#[derive(Debug, Default)]
struct DriverOptions {
    dims: Option<usize>,
    iterations: Option<usize>,
    init_samples: Option<usize>,
    seed: Option<u64>,
    points: Option<Vec<Vec<f64>>>,
    response_timeout_ms: Option<u64>,
    retry: Option<u32>,
    worker_args: Vec<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let command = match parse_args(&args) {
        Ok(c) => c,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start runtime: {e}");
            process::exit(1);
        }
    };

    let code = match command {
        Command::Worker(opts) => runtime.block_on(worker_main(opts)),
        Command::Driver(opts) => runtime.block_on(driver_main(opts)),
    };

    // A blocked stdin read would hold up runtime shutdown.
    process::exit(code);
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args.get(1).map(String::as_str) {
        Some("worker") => parse_worker(&args[2..]).map(Command::Worker),
        Some("driver") => parse_driver(&args[2..]).map(Command::Driver),
        Some("--help") | Some("-h") => Err(String::new()),
        Some(other) => Err(format!("unknown command: {other}")),
        None => Err("missing command: worker or driver".to_string()),
    }
}

fn flag_value<T: FromStr>(args: &[String], i: &mut usize, flag: &str) -> Result<T, String> {
    *i += 1;
    let raw = args
        .get(*i)
        .ok_or_else(|| format!("{flag} requires a value"))?;
    raw.parse()
        .map_err(|_| format!("invalid value for {flag}: {raw}"))
}

fn parse_worker(args: &[String]) -> Result<WorkerOptions, String> {
    let mut opts = WorkerOptions {
        objective: "offset-sphere".to_string(),
        crash_after: None,
        fail_at: None,
        hang_at: None,
        print_calls: false,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--objective" => opts.objective = flag_value(args, &mut i, "--objective")?,
            "--crash-after" => opts.crash_after = Some(flag_value(args, &mut i, "--crash-after")?),
            "--fail-at" => opts.fail_at = Some(flag_value(args, &mut i, "--fail-at")?),
            "--hang-at" => opts.hang_at = Some(flag_value(args, &mut i, "--hang-at")?),
            "--print-calls" => opts.print_calls = true,
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    if !matches!(opts.objective.as_str(), "offset-sphere" | "branin") {
        return Err(format!(
            "unknown objective '{}', expected 'offset-sphere' or 'branin'",
            opts.objective
        ));
    }
    Ok(opts)
}

fn parse_driver(args: &[String]) -> Result<DriverOptions, String> {
    let mut opts = DriverOptions::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--dims" => opts.dims = Some(flag_value(args, &mut i, "--dims")?),
            "--iterations" => opts.iterations = Some(flag_value(args, &mut i, "--iterations")?),
            "--init-samples" => {
                opts.init_samples = Some(flag_value(args, &mut i, "--init-samples")?)
            }
            "--seed" => opts.seed = Some(flag_value(args, &mut i, "--seed")?),
            "--points" => {
                let raw: String = flag_value(args, &mut i, "--points")?;
                opts.points = Some(parse_points(&raw)?);
            }
            "--response-timeout-ms" => {
                opts.response_timeout_ms = Some(flag_value(args, &mut i, "--response-timeout-ms")?)
            }
            "--retry" => opts.retry = Some(flag_value(args, &mut i, "--retry")?),
            "--" => {
                opts.worker_args = args[i + 1..].to_vec();
                break;
            }
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }
    Ok(opts)
}

/// `"x,y;x,y"` → `[[x, y], [x, y]]`. An empty string is an empty list.
fn parse_points(raw: &str) -> Result<Vec<Vec<f64>>, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Vec::new());
    }

    let points = raw
        .split(';')
        .map(|point| {
            point
                .split(',')
                .map(|x| {
                    x.trim()
                        .parse::<f64>()
                        .map_err(|_| format!("invalid coordinate '{}'", x.trim()))
                })
                .collect::<Result<Vec<f64>, String>>()
        })
        .collect::<Result<Vec<_>, String>>()?;

    if let Some(first) = points.first()
        && points.iter().any(|p| p.len() != first.len())
    {
        return Err("all points must have the same number of coordinates".to_string());
    }
    Ok(points)
}

enum DemoObjective {
    Sphere(OffsetSphere),
    Branin(Branin),
}

/// Wraps the served objective with the misbehaviour requested on the
/// command line.
struct FaultInjection {
    inner: DemoObjective,
    calls: u64,
    crash_after: Option<u64>,
    fail_at: Option<u64>,
    hang_at: Option<u64>,
    print_calls: bool,
}

impl Objective for FaultInjection {
    fn evaluate(&mut self, point: &[f64]) -> Result<f64, ObjectiveError> {
        self.calls += 1;
        if self.print_calls {
            println!("objective call {} at {point:?}", self.calls);
        }
        if self.crash_after.is_some_and(|n| self.calls > n) {
            tracing::error!(call = self.calls, "Simulating worker crash");
            process::exit(3);
        }
        if self.hang_at == Some(self.calls) {
            tracing::warn!(call = self.calls, "Simulating hung objective");
            loop {
                std::thread::park();
            }
        }
        if self.fail_at == Some(self.calls) {
            return Err(ObjectiveError::new(format!(
                "injected failure on call {}",
                self.calls
            )));
        }
        match &mut self.inner {
            DemoObjective::Sphere(f) => f.evaluate(point),
            DemoObjective::Branin(f) => f.evaluate(point),
        }
    }
}

async fn worker_main(opts: WorkerOptions) -> i32 {
    let inner = match opts.objective.as_str() {
        "branin" => DemoObjective::Branin(Branin),
        _ => DemoObjective::Sphere(OffsetSphere::default()),
    };
    let objective = FaultInjection {
        inner,
        calls: 0,
        crash_after: opts.crash_after,
        fail_at: opts.fail_at,
        hang_at: opts.hang_at,
        print_calls: opts.print_calls,
    };

    match run_worker(objective).await {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

async fn driver_main(opts: DriverOptions) -> i32 {
    match run_driver(opts).await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                if report.result.status.is_success() { 0 } else { 1 }
            }
            Err(e) => {
                eprintln!("error: failed to serialize report: {e}");
                1
            }
        },
        Err(e) => {
            eprintln!("error: {e}");
            1
        }
    }
}

async fn run_driver(opts: DriverOptions) -> anyhow::Result<RunReport> {
    let mut bridge = BridgeConfig::from_env().context("reading bridge configuration")?;
    if let Some(ms) = opts.response_timeout_ms {
        bridge = bridge.with_response_timeout(Duration::from_millis(ms));
    }
    if let Some(max_attempts) = opts.retry {
        bridge = bridge.with_failure_policy(ObjectiveFailurePolicy::Retry { max_attempts });
    }

    let dims = opts
        .dims
        .or_else(|| opts.points.as_ref().and_then(|p| p.first()).map(Vec::len))
        .unwrap_or(2);
    let problem = Problem::unit_cube(dims)?;

    let mut builder = OptimizerConfig::builder();
    if let Some(n) = opts.iterations {
        builder = builder.n_iterations(n);
    }
    if let Some(n) = opts.init_samples {
        builder = builder.n_init_samples(n);
    }
    if let Some(seed) = opts.seed {
        builder = builder.random_seed(seed);
    }
    let optimizer_config = builder.build()?;

    let launcher = ProcessLauncher::current_exe()?
        .arg("worker")
        .args(opts.worker_args);
    let driver = Driver::new(bridge);

    let report = match opts.points {
        Some(points) => {
            driver
                .run(
                    &launcher,
                    ScriptedOptimizer::new(points),
                    problem,
                    optimizer_config,
                )
                .await?
        }
        None => {
            driver
                .run(&launcher, RandomSearch, problem, optimizer_config)
                .await?
        }
    };
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("evalbridge")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn parses_points() {
        assert_eq!(
            parse_points("0.5,0.5; 0.53,0.53").unwrap(),
            vec![vec![0.5, 0.5], vec![0.53, 0.53]]
        );
        assert!(parse_points("").unwrap().is_empty());
        assert!(parse_points("0.1,0.2;0.3").is_err());
        assert!(parse_points("0.1,abc").is_err());
    }

    #[test]
    fn driver_forwards_worker_args() {
        let Command::Driver(opts) = parse_args(&args(&[
            "driver",
            "--points",
            "0.5,0.5",
            "--retry",
            "2",
            "--",
            "--fail-at",
            "1",
        ]))
        .unwrap() else {
            panic!("expected driver command");
        };
        assert_eq!(opts.retry, Some(2));
        assert_eq!(opts.points, Some(vec![vec![0.5, 0.5]]));
        assert_eq!(opts.worker_args, vec!["--fail-at", "1"]);
    }

    #[test]
    fn worker_defaults_to_offset_sphere() {
        let Command::Worker(opts) = parse_args(&args(&["worker"])).unwrap() else {
            panic!("expected worker command");
        };
        assert_eq!(opts.objective, "offset-sphere");
        assert_eq!(opts.crash_after, None);
        assert!(!opts.print_calls);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_args(&args(&[])).is_err());
        assert!(parse_args(&args(&["serve"])).is_err());
        assert!(parse_args(&args(&["worker", "--objective", "rosenbrock"])).is_err());
        assert!(parse_args(&args(&["driver", "--dims"])).is_err());
        assert!(parse_args(&args(&["driver", "--dims", "two"])).is_err());
    }

    #[test]
    fn injected_failure_hits_the_requested_call() {
        let mut objective = FaultInjection {
            inner: DemoObjective::Sphere(OffsetSphere::default()),
            calls: 0,
            crash_after: None,
            fail_at: Some(2),
            hang_at: None,
            print_calls: false,
        };
        assert_eq!(objective.evaluate(&[0.53]), Ok(10.0));
        assert!(objective.evaluate(&[0.53]).is_err());
        assert_eq!(objective.evaluate(&[0.53]), Ok(10.0));
    }
}
