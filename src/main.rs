//! Binary entry point: delegates to [`navigator::run`].

use navigator::error::report_and_exit;

#[tokio::main]
async fn main() {
    if let Err(err) = navigator::run().await {
        report_and_exit(err.into());
    }
}
