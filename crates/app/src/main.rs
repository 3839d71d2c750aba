#[tokio::main]
async fn main() {
    if let Err(error) = framedouble_app::run_from_env().await {
        tracing::error!(kind = framedouble_app::error_kind(&error), "{error:#}");
        std::process::exit(framedouble_app::exit_code(&error));
    }
}
