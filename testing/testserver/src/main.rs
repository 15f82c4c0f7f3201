use clap::Parser;
use testserver::Reflection;

#[derive(Parser, Debug)]
#[command(name = "testserver", about = "Test gRPC server for grpcmd")]
struct Cli {
    /// Port to listen on (0 for ephemeral)
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    port: u16,

    /// Disable server reflection
    #[arg(long = "noreflect")]
    noreflect: bool,

    /// Serve only the v1alpha reflection protocol
    #[arg(long = "v1alpha-only", conflicts_with = "noreflect")]
    v1alpha_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), testserver::BoxError> {
    let cli = Cli::parse();

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", cli.port)).await?;
    println!("Listening on {}", listener.local_addr()?);

    let reflection = if cli.noreflect {
        Reflection::Disabled
    } else if cli.v1alpha_only {
        Reflection::V1AlphaOnly
    } else {
        Reflection::Enabled
    };

    tokio::select! {
        result = testserver::serve(listener, reflection) => result,
        _ = tokio::signal::ctrl_c() => Ok(()),
    }
}
