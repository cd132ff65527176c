pub mod args;
pub mod cadence;
pub mod error;
pub mod hub;
pub mod phases;
pub mod reconnect;
pub mod resources;
pub mod state;
pub mod validate;

use error::Result;
use hub::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, GatewayFactory};
use phases::{Ctx, RunOptions};
use state::{StateEngine, default_state_dir};
use switchover_common::shutdown;

pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire everything together and drive the run: gateways, state engine,
/// signal-derived cancellation, then the phase loop.
pub async fn run(args: args::Args) -> Result<()> {
    args.validate()?;

    let cancel = shutdown::cancel_on_signal();
    let kubeconfig_paths = hub::kubeconfig_paths(args.kubeconfig.as_deref());
    let factory = GatewayFactory::load(
        kubeconfig_paths.clone(),
        args.kubeconfig_max_bytes,
        DEFAULT_READ_TIMEOUT,
        DEFAULT_CONNECT_TIMEOUT,
        args.dry_run,
        cancel.clone(),
    )?;
    let primary = factory
        .build(&args.primary, !args.no_verify_tls_primary)
        .await?;
    let secondary = factory
        .build(&args.secondary, !args.no_verify_tls_secondary)
        .await?;

    let state_dir = args.state_dir.clone().unwrap_or_else(default_state_dir);
    let mut state = StateEngine::open(
        &state_dir,
        &args.primary,
        &args.secondary,
        TOOL_VERSION,
        args.dry_run,
        args.lock_wait(),
    )?;

    let opts = RunOptions::from_args(&args, kubeconfig_paths);
    let mut cx = Ctx {
        primary: &primary,
        secondary: &secondary,
        factory: &factory,
        state: &mut state,
        cancel: &cancel,
        opts,
    };
    phases::run(&mut cx).await
}
