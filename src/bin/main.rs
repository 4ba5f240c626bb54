//! uvmctl - utility VM tooling

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use hcs_uvm::uvm::document::prepare_config_doc;
use hcs_uvm::uvm::options::HostCapacity;
use hcs_uvm::merge::merge_json;
use hcs_uvm::UvmOptions;

#[derive(Parser)]
#[command(name = "uvmctl")]
#[command(about = "Create Windows utility VMs through HCS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct VmArgs {
    /// Utility VM id (generated when omitted)
    #[arg(long)]
    id: Option<String>,
    /// Memory in MB
    #[arg(short, long, default_value = "1024")]
    memory: u64,
    /// Virtual processors
    #[arg(short, long, default_value = "2")]
    cpus: u32,
    /// Layer folders, image first, scratch last
    #[arg(short, long = "layer", required = true)]
    layers: Vec<PathBuf>,
    /// Back memory with physical pages
    #[arg(long)]
    no_overcommit: bool,
    /// Serve the guest connection over an external hypervisor socket
    #[arg(long)]
    external_gcs: bool,
    /// Create the VM so it can be saved as a template
    #[arg(long)]
    template: bool,
    /// JSON merged over the generated document
    #[arg(long, default_value = "")]
    additional_json: String,
}

impl VmArgs {
    fn options(&self) -> UvmOptions {
        let mut builder = UvmOptions::builder()
            .memory_mb(self.memory)
            .processors(self.cpus)
            .allow_overcommit(!self.no_overcommit)
            .external_guest_connection(self.external_gcs)
            .layer_folders(self.layers.iter().cloned())
            .additional_json(self.additional_json.clone());
        if let Some(id) = &self.id {
            builder = builder.id(id.clone());
        }
        if self.template {
            builder = builder.template();
        }
        builder.build()
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the compute system document without creating anything
    Render {
        #[command(flatten)]
        vm: VmArgs,
        /// Host logical processors (defaults to this machine)
        #[arg(long)]
        host_processors: Option<u32>,
    },
    /// Create and start a utility VM, then wait for Ctrl-C (Windows only)
    Create {
        #[command(flatten)]
        vm: VmArgs,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("hcs_uvm=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render { vm, host_processors } => cmd_render(&vm, host_processors)?,
        Commands::Create { vm } => cmd_create(&vm).await?,
    }

    Ok(())
}

fn cmd_render(args: &VmArgs, host_processors: Option<u32>) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.options();
    opts.validate()?;

    let logical_processor_count = match host_processors {
        Some(n) => n,
        None => std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1),
    };
    let resolved = opts.resolve(&HostCapacity { logical_processor_count });

    // the image is expected in the top-most read-only layer
    let uvm_folder = opts.layer_folders.first().cloned().unwrap_or_default();
    let doc = prepare_config_doc(&opts, &resolved, &uvm_folder);
    let document = merge_json(serde_json::to_value(&doc)?, &opts.additional_hcs_document_json)?;

    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}

#[cfg(windows)]
async fn cmd_create(args: &VmArgs) -> Result<(), Box<dyn std::error::Error>> {
    let opts = args.options();
    println!("Creating utility VM '{}'...", opts.id);
    println!("  Memory: {} MB", opts.memory_size_in_mb);
    println!("  CPUs: {}", opts.processor_count);

    let host = hcs_uvm::Host::local();
    let vm = hcs_uvm::create_wcow(&host, opts).await?;
    vm.start().await?;

    println!("Started utility VM '{}' (runtime id {})", vm.id(), vm.runtime_id());
    if let Some(addr) = vm.guest_listener_addr() {
        println!("  Guest channel: {}", addr);
    }
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    vm.terminate().await?;
    vm.close();
    println!("Utility VM '{}' stopped.", vm.id());
    Ok(())
}

#[cfg(not(windows))]
async fn cmd_create(_args: &VmArgs) -> Result<(), Box<dyn std::error::Error>> {
    Err("creating a utility VM requires Windows with the Host Compute Service".into())
}
