use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vcdora::config::VcdoraConfig;
use vcdora::host::{Call, Host};
use vcdora::ledger::TokenLedger;
use vcdora::units::{epoch_floor, to_ether, to_wei, WEEK};
use vcdora::{Address, Amount, Clock, ManualClock, SystemClock, Timestamp};

#[derive(Parser)]
#[command(name = "vcdora", version, about = "Vote-escrow ledger host (TestToken + vcDORA)")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "VCDORA_CONFIG", default_value = "vcdora.toml")]
    config: PathBuf,

    /// State snapshot (overrides config and VCDORA_STATE).
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Fixed block time in Unix seconds instead of the system clock.
    #[arg(long, global = true)]
    now: Option<Timestamp>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh state with a TestToken minted to the founder and an escrow.
    Deploy {
        #[arg(long, value_parser = parse_account)]
        founder: Address,
        /// Initial supply in whole tokens (default from config).
        #[arg(long)]
        supply: Option<u64>,
        /// Overwrite an existing state file.
        #[arg(long)]
        force: bool,
    },
    /// Bind the escrow to the token; the caller becomes admin.
    Init {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        symbol: Option<String>,
    },
    Transfer {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long, value_parser = parse_account)]
        to: Address,
        #[arg(long)]
        amount: f64,
    },
    /// Approve a spender; defaults to the escrow.
    Approve {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long, value_parser = parse_account)]
        spender: Option<Address>,
        #[arg(long)]
        amount: f64,
    },
    /// Spend an allowance granted by `owner`.
    TransferFrom {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long, value_parser = parse_account)]
        owner: Address,
        #[arg(long, value_parser = parse_account)]
        to: Address,
        #[arg(long)]
        amount: f64,
    },
    Balance {
        #[arg(value_parser = parse_account)]
        account: Address,
    },
    CreateLock {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long)]
        amount: f64,
        #[command(flatten)]
        unlock: UnlockArgs,
    },
    IncreaseAmount {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long)]
        amount: f64,
    },
    IncreaseUnlockTime {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[command(flatten)]
        unlock: UnlockArgs,
    },
    /// Add tokens paid by `from` to the lock of `account`.
    DepositFor {
        #[arg(long, value_parser = parse_account)]
        from: Address,
        #[arg(long, value_parser = parse_account)]
        account: Address,
        #[arg(long)]
        amount: f64,
    },
    Withdraw {
        #[arg(long, value_parser = parse_account)]
        from: Address,
    },
    Checkpoint {
        #[arg(long, value_parser = parse_account)]
        from: Address,
    },
    /// Aggregate voting weight.
    Supply {
        #[arg(long, conflicts_with = "epochs_ahead")]
        at: Option<Timestamp>,
        /// Query the epoch boundary this many weeks after the current one.
        #[arg(long)]
        epochs_ahead: Option<u64>,
    },
    VotingPower {
        #[arg(value_parser = parse_account)]
        account: Address,
        #[arg(long)]
        at: Option<Timestamp>,
    },
    Locked {
        #[arg(value_parser = parse_account)]
        account: Address,
    },
    Admin,
    Status,
    /// Print a random account address.
    NewAccount,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct UnlockArgs {
    /// Absolute unlock time (Unix seconds, snapped down to a week).
    #[arg(long)]
    unlock: Option<Timestamp>,
    /// Lock for this many weeks from now.
    #[arg(long)]
    weeks: Option<u64>,
}

impl UnlockArgs {
    fn resolve(&self, now: Timestamp) -> Timestamp {
        match (self.unlock, self.weeks) {
            (Some(ts), _) => ts,
            (None, Some(weeks)) => now + weeks * WEEK,
            (None, None) => now,
        }
    }
}

/// `0x…` hex is taken literally, anything else is a label.
fn parse_account(raw: &str) -> Result<Address, String> {
    if raw.starts_with("0x") || raw.starts_with("0X") {
        raw.parse().map_err(|e| format!("{e}"))
    } else {
        Ok(Address::from_label(raw))
    }
}

fn amount_arg(tokens: f64) -> Result<Amount> {
    let amount = to_wei(tokens);
    if amount == 0 && tokens != 0.0 {
        bail!("invalid amount {tokens}");
    }
    Ok(amount)
}

fn fmt_amount(amount: Amount) -> String {
    format!("{}", to_ether(amount))
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn clock_for(now: Option<Timestamp>) -> Box<dyn Clock> {
    match now {
        Some(ts) => Box::new(ManualClock::new(ts)),
        None => Box::new(SystemClock),
    }
}

fn open_host(path: &Path, now: Option<Timestamp>) -> Result<Host> {
    if !path.exists() {
        bail!(
            "state file {} not found; run `vcdora deploy --founder <account>` first",
            path.display()
        );
    }
    Host::load(path, clock_for(now)).with_context(|| format!("loading {}", path.display()))
}

//==================== mutating commands ====================//

fn submit(path: &Path, now: Option<Timestamp>, caller: Address, build: impl FnOnce(&Host) -> Result<Call>) -> Result<()> {
    let mut host = open_host(path, now)?;
    let call = build(&host)?;
    let receipt = host.execute(caller, call)?;
    println!(
        "{} ok: height={} ts={} receipt={}",
        receipt.call.name(),
        receipt.height,
        receipt.timestamp,
        receipt.id
    );
    host.save(path)
        .with_context(|| format!("saving {}", path.display()))?;
    Ok(())
}

fn deploy_cmd(
    path: &Path,
    now: Option<Timestamp>,
    config: &VcdoraConfig,
    founder: Address,
    supply: Option<u64>,
    force: bool,
) -> Result<()> {
    if path.exists() && !force {
        bail!("state file {} already exists (use --force to replace)", path.display());
    }
    let mut host = Host::new(clock_for(now));
    let supply = supply.unwrap_or(config.token.initial_supply);
    if supply == 0 {
        bail!("--supply must be > 0");
    }
    let token = host.deploy_token(
        founder,
        founder,
        vcdora::units::tokens(supply),
        config.token.metadata(),
    );
    let escrow = host.deploy_escrow(founder);
    host.save(path)
        .with_context(|| format!("saving {}", path.display()))?;
    println!("founder: {founder}");
    println!("token:   {token} ({} minted)", supply);
    println!("escrow:  {escrow}");
    println!("state:   {}", path.display());
    Ok(())
}

//==================== queries ====================//

fn status_cmd(host: &Host) -> Result<()> {
    let meta = &host.snapshot().meta;
    println!("height {} at {}", meta.height, meta.timestamp);
    let token = host.primary_token()?;
    println!(
        "token  {} {} supply={} root={}",
        token.address(),
        token.symbol(),
        fmt_amount(token.total_supply()),
        hex::encode(token.state_root())
    );
    for (holder, balance) in token.holders() {
        println!("  {holder} {}", fmt_amount(*balance));
    }
    let escrow = host.primary_escrow()?;
    let now = host.now();
    match escrow.config() {
        Some(cfg) => println!(
            "escrow {} {} admin={} locked={} voting={}",
            escrow.address(),
            cfg.symbol,
            cfg.admin,
            fmt_amount(escrow.supply()),
            fmt_amount(escrow.total_supply(now))
        ),
        None => println!("escrow {} (not initialized)", escrow.address()),
    }
    for (account, lock) in escrow.lockers() {
        println!(
            "  {account} amount={} end={} power={}",
            fmt_amount(lock.amount),
            lock.end,
            fmt_amount(escrow.balance_of(account, now))
        );
    }
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = VcdoraConfig::load(Some(&cli.config))?;
    init_tracing(&config.log_filter);
    let path = cli.state.clone().unwrap_or_else(|| config.state_path.clone());
    let now = cli.now;

    match cli.command {
        Command::Deploy {
            founder,
            supply,
            force,
        } => deploy_cmd(&path, now, &config, founder, supply, force),
        Command::Init { from, name, symbol } => submit(&path, now, from, |host| {
            Ok(Call::Init {
                escrow: host.primary_escrow()?.address(),
                token: host.primary_token()?.address(),
                name: name.unwrap_or_else(|| config.escrow.name.clone()),
                symbol: symbol.unwrap_or_else(|| config.escrow.symbol.clone()),
            })
        }),
        Command::Transfer { from, to, amount } => submit(&path, now, from, |host| {
            Ok(Call::Transfer {
                token: host.primary_token()?.address(),
                to,
                amount: amount_arg(amount)?,
            })
        }),
        Command::Approve {
            from,
            spender,
            amount,
        } => submit(&path, now, from, |host| {
            let spender = match spender {
                Some(s) => s,
                None => host.primary_escrow()?.address(),
            };
            Ok(Call::Approve {
                token: host.primary_token()?.address(),
                spender,
                amount: amount_arg(amount)?,
            })
        }),
        Command::TransferFrom {
            from,
            owner,
            to,
            amount,
        } => submit(&path, now, from, |host| {
            Ok(Call::TransferFrom {
                token: host.primary_token()?.address(),
                from: owner,
                to,
                amount: amount_arg(amount)?,
            })
        }),
        Command::CreateLock {
            from,
            amount,
            unlock,
        } => submit(&path, now, from, |host| {
            Ok(Call::CreateLock {
                escrow: host.primary_escrow()?.address(),
                amount: amount_arg(amount)?,
                unlock_time: unlock.resolve(host.now()),
            })
        }),
        Command::IncreaseAmount { from, amount } => submit(&path, now, from, |host| {
            Ok(Call::IncreaseAmount {
                escrow: host.primary_escrow()?.address(),
                amount: amount_arg(amount)?,
            })
        }),
        Command::IncreaseUnlockTime { from, unlock } => submit(&path, now, from, |host| {
            Ok(Call::IncreaseUnlockTime {
                escrow: host.primary_escrow()?.address(),
                unlock_time: unlock.resolve(host.now()),
            })
        }),
        Command::DepositFor {
            from,
            account,
            amount,
        } => submit(&path, now, from, |host| {
            Ok(Call::DepositFor {
                escrow: host.primary_escrow()?.address(),
                account,
                amount: amount_arg(amount)?,
            })
        }),
        Command::Withdraw { from } => submit(&path, now, from, |host| {
            Ok(Call::Withdraw {
                escrow: host.primary_escrow()?.address(),
            })
        }),
        Command::Checkpoint { from } => submit(&path, now, from, |host| {
            Ok(Call::Checkpoint {
                escrow: host.primary_escrow()?.address(),
            })
        }),
        Command::Balance { account } => {
            let host = open_host(&path, now)?;
            println!("{}", fmt_amount(host.primary_token()?.balance_of(&account)));
            Ok(())
        }
        Command::Supply { at, epochs_ahead } => {
            let host = open_host(&path, now)?;
            let t = match (at, epochs_ahead) {
                (Some(ts), _) => ts,
                (None, Some(n)) => epoch_floor(host.now()) + n * WEEK,
                (None, None) => host.now(),
            };
            let supply = host.primary_escrow()?.total_supply_at_future(t);
            println!("{} at {t}", fmt_amount(supply));
            Ok(())
        }
        Command::VotingPower { account, at } => {
            let host = open_host(&path, now)?;
            let t = at.unwrap_or_else(|| host.now());
            println!("{} at {t}", fmt_amount(host.primary_escrow()?.balance_of(&account, t)));
            Ok(())
        }
        Command::Locked { account } => {
            let host = open_host(&path, now)?;
            let lock = host.primary_escrow()?.locked(&account);
            println!("amount={} end={}", fmt_amount(lock.amount), lock.end);
            Ok(())
        }
        Command::Admin => {
            let host = open_host(&path, now)?;
            match host.primary_escrow()?.admin() {
                Some(admin) => println!("{admin}"),
                None => bail!("escrow is not initialized"),
            }
            Ok(())
        }
        Command::Status => status_cmd(&open_host(&path, now)?),
        Command::NewAccount => {
            println!("{}", Address::random());
            Ok(())
        }
    }
}
