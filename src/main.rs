use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, Level};

use shared::KeyPair;
use veil_core::{
    BlockStore, ChainManager, Chainstate, CompStore, ComputationFactory, ComputationRegistry,
    DevBackend, FheFactory, MemPool, Wallet,
};

mod config;
mod conn;
mod message;
mod node;
mod peer;
mod router;
mod rpc;

use config::Config;
use conn::ConnectionManager;
use node::Node;

#[derive(Parser)]
#[command(name = "veil")]
#[command(about = "Veil - nó blockchain com consenso por prova de computação homomórfica")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inicia o nó
    Run(RunArgs),
    /// Gera um par de chaves de carteira (base64)
    Keygen,
}

#[derive(Args)]
struct RunArgs {
    /// Caminho do arquivo de configuração TOML
    #[arg(short, long, default_value = "config/veil.toml")]
    config: String,

    /// Habilita o laço de mineração
    #[arg(long)]
    mine: bool,

    /// Nível de log (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> shared::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_node(&args).await,
        Commands::Keygen => {
            keygen();
            Ok(())
        }
    }
}

fn keygen() {
    let keypair = KeyPair::generate();
    println!("public_key = \"{}\"", config::encode_b64(&keypair.public_key));
    println!("secret_key = \"{}\"", config::encode_b64(keypair.secret_bytes()));
}

async fn run_node(args: &RunArgs) -> shared::Result<()> {
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    info!("🚀 Iniciando nó Veil");

    let cfg = Config::load(&args.config)?;
    let params = cfg.chain_params()?;

    let chainstate = Arc::new(Chainstate::new());
    let block_store = Arc::new(BlockStore::new());
    let mem_pool = Arc::new(MemPool::new());
    let comp_store = Arc::new(CompStore::new());
    let stop_flag = Arc::new(AtomicBool::new(false));

    let wallet = match &cfg.wallet {
        Some(section) => Arc::new(Wallet::from_keys(
            &config::decode_b64(&section.public_key)?,
            &config::decode_b64(&section.secret_key)?,
        )?),
        None => Arc::new(Wallet::new_random()),
    };

    let chain_manager = Arc::new(ChainManager::new(
        params,
        Arc::clone(&chainstate),
        Arc::clone(&block_store),
        Arc::clone(&mem_pool),
        Arc::clone(&comp_store),
        Arc::clone(&stop_flag),
        Arc::clone(&wallet),
    )?);
    info!("✅ Cadeia inicializada na gênese");

    // motor FHE: backend de desenvolvimento até um motor real ser plugado
    let backend = Arc::new(DevBackend);
    let fhe_factory = Arc::new(FheFactory::new(backend));
    let mut registry = ComputationRegistry::new();
    registry.register(Arc::clone(&fhe_factory) as Arc<dyn ComputationFactory>);
    let registry = Arc::new(registry);

    let conn = Arc::new(ConnectionManager::new(&cfg.net));
    let node_ref = Arc::new(Node::new(
        Arc::clone(&conn),
        Arc::clone(&chain_manager),
        registry,
        fhe_factory,
        Arc::clone(&wallet),
        Arc::clone(&stop_flag),
        tokio::runtime::Handle::current(),
    ));

    {
        let conn = Arc::clone(&conn);
        let node = Arc::clone(&node_ref);
        tokio::spawn(async move {
            if let Err(e) = conn.listen(node).await {
                error!(error = %e, "aceitador de peers terminou");
            }
        });
    }

    {
        let node = Arc::clone(&node_ref);
        let address = cfg.net.rpc_address.clone();
        let port = cfg.net.rpc_port;
        tokio::spawn(async move {
            if let Err(e) = rpc::serve(node, address, port).await {
                error!(error = %e, "servidor RPC terminou");
            }
        });
    }

    Arc::clone(&node_ref).bootstrap(&cfg.net.bootstrap).await;

    // dá tempo ao gestor de conexões antes de eleger o peer de sincronização
    tokio::time::sleep(Duration::from_secs(4)).await;
    node_ref.start_sync().await?;

    if args.mine {
        let node = Arc::clone(&node_ref);
        std::thread::spawn(move || node.mining_loop());
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| shared::CoreError::IoError(e.to_string()))?;
    info!("🛑 Sinal de encerramento recebido, desligando");
    Ok(())
}
