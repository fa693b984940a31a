use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lottery_ledger::{
    chain::{Chain, ChainParams, GenesisAccount},
    config::Scenario,
    units::{format_ether, parse_amount, ETHER},
    AccountId,
};

#[derive(Parser)]
#[command(name = "lottery-ledger", version, about = "Pooled-wager lottery on an in-process ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a JSON scenario and print one receipt per line
    Run {
        scenario: PathBuf,
    },
    /// Fund N players, let each enter once per round, settle every round
    Demo {
        #[arg(long, default_value_t = 3)]
        players: usize,
        #[arg(long, default_value = "1.1finney")]
        stake: String,
        #[arg(long, default_value_t = 1)]
        rounds: u32,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

//==================== логирование ====================//

fn init_tracing() {
    // RUST_LOG wins; unset or invalid falls back to `info`
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

//==================== run ====================//

fn run_cmd(path: PathBuf) -> Result<()> {
    let scenario = Scenario::load(&path)?;
    let calls = scenario.resolve_calls()?;
    let mut chain = scenario
        .build_chain()
        .with_context(|| format!("building chain for {}", path.display()))?;

    for call in calls {
        match call {
            Some(call) => {
                let receipt = chain.execute(call);
                println!("{}", serde_json::to_string(&receipt)?);
            }
            None => {
                let players = chain.players()?;
                println!("{}", serde_json::json!({ "players": players }));
            }
        }
    }

    print_summary(&chain)
}

//==================== demo ====================//

fn demo_cmd(players: usize, stake: &str, rounds: u32, seed: u64) -> Result<()> {
    if players < 2 {
        bail!("--players must be at least 2");
    }
    let stake = parse_amount(stake).with_context(|| format!("invalid --stake '{stake}'"))?;
    let manager: AccountId = "manager".into();
    let names: Vec<AccountId> = (1..=players).map(|i| format!("player-{i}")).collect();

    let mut genesis = vec![GenesisAccount {
        id: manager.clone(),
        balance: 0,
        rejects_payments: false,
    }];
    genesis.extend(names.iter().map(|id| GenesisAccount {
        id: id.clone(),
        balance: 100 * ETHER,
        rejects_payments: false,
    }));

    let params = ChainParams {
        seed,
        ..ChainParams::default()
    };
    let mut chain = Chain::new(params, &genesis)?;
    let address = chain.deploy(&manager, stake)?;
    println!("lottery deployed → {address} (minimum stake {})", format_ether(stake));

    for round in 0..rounds {
        for name in &names {
            chain.enter(name, stake)?;
        }
        let settlement = chain.pick_winner(&manager)?;
        println!(
            "round {round}: {} wins {} ({} entrants)",
            settlement.winner,
            format_ether(settlement.payout),
            settlement.entrants
        );
    }

    print_summary(&chain)
}

fn print_summary(chain: &Chain) -> Result<()> {
    let lottery = chain.lottery()?;
    let snapshot = chain.snapshot();
    println!(
        "height {} | rounds {} | players {} | pool {} | contract balance {} | state root {}",
        chain.height(),
        chain.rounds()?,
        lottery.get_players().len(),
        format_ether(lottery.pool()),
        format_ether(chain.contract_balance()),
        hex::encode(snapshot.ledger.state_root)
    );
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Run { scenario } => run_cmd(scenario),
        Command::Demo {
            players,
            stake,
            rounds,
            seed,
        } => demo_cmd(players, &stake, rounds, seed),
    }
}
