use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use tokenkit::logging::{init_logging, LogFormat};
use tokenkit::script::address_hash;
use tokenkit::storage::{MemoryCache, SledCache, StateCache};
use tokenkit::{HoldingSource, KitConfig, MockRun, OfferParams, OrderLock, RunInstance, TokenKit};

/// Token helpers over a smart-contract runtime.
#[derive(Parser)]
#[command(name = "tokenkit")]
#[command(version)]
#[command(about = "Fungible/non-fungible token tooling and OrderLock offers", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "TOKENKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format: human or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the OrderLock locking script for a price
    LockScript {
        /// Address the price is paid to
        #[arg(long)]
        address: String,

        /// Price in satoshis
        #[arg(long)]
        satoshis: u64,
    },

    /// Check that an address decodes to a P2PKH hash
    CheckAddress { address: String },

    /// Run token and offer scenarios against the in-process runtime
    Demo,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KitConfig::from_toml_file(path)?,
        None => KitConfig::default(),
    };
    let format = match cli.log_format {
        Some(format) => format,
        None => config.log_format.parse()?,
    };
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    init_logging(format, &level)?;

    match cli.command {
        Commands::LockScript { address, satoshis } => {
            let lock = OrderLock::new(address, satoshis)?;
            println!("{}", hex::encode(lock.script()?.as_bytes()));
        }
        Commands::CheckAddress { address } => {
            let hash = address_hash(&address)?;
            println!("{} -> {}", address, hex::encode(hash));
        }
        Commands::Demo => demo(config).await?,
    }

    Ok(())
}

async fn demo(config: KitConfig) -> Result<(), Box<dyn std::error::Error>> {
    let cache: Arc<dyn StateCache> = match &config.cache_path {
        Some(path) => Arc::new(SledCache::new(path)?),
        None => Arc::new(MemoryCache::new()),
    };
    let run = Arc::new(MockRun::with_cache(cache));
    let kit = TokenKit::with_config(run.clone(), config);
    info!(owner = %run.owner_address(), purse = %run.purse_address(), "demo runtime ready");

    let coin = kit
        .ft()
        .deploy(json!({
            "className": "FooCoin",
            "metadata": { "name": "Foo Coin" },
            "symbol": "FOO",
            "decimals": 2,
        }))
        .await?;
    println!("FooCoin deployed at {}", coin.location());

    let owner = run.owner_address();
    kit.ft()
        .mint(
            &coin.origin(),
            vec![(5020, owner.clone()), (1001, owner.clone()), (3048, owner.clone())],
        )
        .await?;
    let mut coins = kit.ft().get_jig_box(&coin.origin()).await?;
    println!("Balance: {} FOO", coins.balance_as_decimal()?);

    let friend = run.purse_address();
    let txid = coins.send(friend, 4000).await?;
    println!("Sent 40.00 FOO in {}; balance {} FOO", txid, coins.balance_as_decimal()?);

    let art = kit
        .nft()
        .deploy(json!({
            "className": "FooArt",
            "metadata": { "name": "Foo Art" },
            "maxSupply": 2,
        }))
        .await?;
    kit.nft().mint(&art.origin(), vec![owner.clone(), owner.clone()]).await?;
    let pieces = kit.nft().get_jig_box(&art.origin()).await?;
    println!("FooArt pieces held: {}", pieces.jigs().len());
    if let Err(e) = kit.nft().mint(&art.origin(), vec![owner.clone()]).await {
        println!("Third mint refused: {}", e);
    }

    let offer = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Box {
                jigbox: &mut coins,
                amount: Some(1000),
            }),
            address: owner.clone(),
            satoshis: 5000,
        })
        .await?;
    println!("Offer of 10.00 FOO for 5000 sat at {}", offer.location());
    println!("Open offers: {}", kit.dex().list_offers(&coin.origin()).await?.len());

    let txid = kit.dex().take_offer(&offer.location()).await?;
    println!("Offer taken in {}", txid);

    let piece = pieces.jigs().first().cloned().ok_or("no FooArt piece held")?;
    let offer = kit
        .dex()
        .create_offer(OfferParams {
            source: Some(HoldingSource::Unit(piece)),
            address: owner,
            satoshis: 100_000,
        })
        .await?;
    let txid = kit.dex().cancel_offer(&offer.location()).await?;
    println!("FooArt offer cancelled in {}", txid);

    coins.sync().await?;
    println!("Final balance: {} FOO", coins.balance_as_decimal()?);
    Ok(())
}
