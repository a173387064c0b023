//! # Fabric CLI Entry Point
//!
//! Command-line access to a Fabric cluster through the client transport.
//!
//! ## Usage
//!
//! ```bash
//! # Fetch the server version (prints the raw response body)
//! fabric call GET /_api/version --host 127.0.0.1:8529
//!
//! # Insert a document into a tenant's database over VST
//! fabric call POST /_api/document/users --protocol vst \
//!   --tenant acme --database shop --body '{"name": "ada"}' \
//!   --user root --password secret
//!
//! # List the coordinators the cluster reports
//! fabric endpoints --host 10.0.0.1:8529 --api-key "$FABRIC_API_KEY"
//! ```
//!
//! Hosts are `host:port` pairs; `--host` may be repeated. Settings not given
//! on the command line come from `--config` (JSON) or the defaults.

use anyhow::{Context, Result};
use argh::FromArgs;
use fabric_client::{ClientConfig, Executor, WireProtocol};
use fabric_common::auth::Credentials;
use fabric_common::{Request, RequestMethod};
use std::io::Write;

/// Fabric - client for multi-tenant Fabric clusters
#[derive(FromArgs)]
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Call(CallArgs),
    Endpoints(EndpointsArgs),
}

// The response body goes to stdout as-is; errors go to stderr with a
// non-zero exit code.
#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// send one request and print the response body
struct CallArgs {
    /// HTTP method (GET, POST, PUT, PATCH, DELETE, HEAD, OPTIONS)
    #[argh(positional, from_str_fn(parse_method))]
    method: RequestMethod,

    /// request path, e.g. /_api/version
    #[argh(positional)]
    path: String,

    /// JSON request body
    #[argh(option, short = 'b')]
    body: Option<String>,

    /// tenant the request is addressed to
    #[argh(option, short = 't')]
    tenant: Option<String>,

    /// database the request is addressed to
    #[argh(option, short = 'd')]
    database: Option<String>,

    /// extra header as `name: value`; may be repeated
    #[argh(option, long = "header", from_str_fn(parse_header))]
    headers: Vec<(String, String)>,

    /// query parameter as `name=value`; may be repeated
    #[argh(option, long = "query", from_str_fn(parse_query))]
    query: Vec<(String, String)>,

    /// coordinator address as host:port; may be repeated
    #[argh(option, short = 'H', long = "host")]
    hosts: Vec<String>,

    /// wire protocol: http or vst
    #[argh(option, from_str_fn(parse_protocol))]
    protocol: Option<WireProtocol>,

    /// API key for authentication
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// user name for token authentication
    #[argh(option, short = 'u')]
    user: Option<String>,

    /// password of --user
    #[argh(option, short = 'p')]
    password: Option<String>,

    /// JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "endpoints")]
/// print the endpoints the cluster reports
struct EndpointsArgs {
    /// coordinator address as host:port; may be repeated
    #[argh(option, short = 'H', long = "host")]
    hosts: Vec<String>,

    /// wire protocol: http or vst
    #[argh(option, from_str_fn(parse_protocol))]
    protocol: Option<WireProtocol>,

    /// API key for authentication
    #[argh(option, long = "api-key")]
    api_key: Option<String>,

    /// user name for token authentication
    #[argh(option, short = 'u')]
    user: Option<String>,

    /// password of --user
    #[argh(option, short = 'p')]
    password: Option<String>,

    /// JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,
}

/// Connection settings shared by every subcommand.
struct ConnectOptions<'a> {
    config: Option<&'a str>,
    hosts: &'a [String],
    protocol: Option<WireProtocol>,
    api_key: Option<&'a str>,
    user: Option<&'a str>,
    password: Option<&'a str>,
}

impl CallArgs {
    fn connect_options(&self) -> ConnectOptions<'_> {
        ConnectOptions {
            config: self.config.as_deref(),
            hosts: &self.hosts,
            protocol: self.protocol,
            api_key: self.api_key.as_deref(),
            user: self.user.as_deref(),
            password: self.password.as_deref(),
        }
    }
}

impl EndpointsArgs {
    fn connect_options(&self) -> ConnectOptions<'_> {
        ConnectOptions {
            config: self.config.as_deref(),
            hosts: &self.hosts,
            protocol: self.protocol,
            api_key: self.api_key.as_deref(),
            user: self.user.as_deref(),
            password: self.password.as_deref(),
        }
    }
}

fn parse_method(value: &str) -> Result<RequestMethod, String> {
    RequestMethod::parse(value).ok_or_else(|| format!("unknown method '{}'", value))
}

fn parse_protocol(value: &str) -> Result<WireProtocol, String> {
    match value.to_ascii_lowercase().as_str() {
        "http" => Ok(WireProtocol::Http),
        "vst" => Ok(WireProtocol::Vst),
        _ => Err(format!("unknown protocol '{}', expected http or vst", value)),
    }
}

fn parse_header(value: &str) -> Result<(String, String), String> {
    let (name, header_value) = value
        .split_once(':')
        .ok_or_else(|| format!("header '{}' must look like 'name: value'", value))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("header '{}' has no name", value));
    }
    Ok((name.to_string(), header_value.trim().to_string()))
}

fn parse_query(value: &str) -> Result<(String, String), String> {
    let (name, param) = value
        .split_once('=')
        .ok_or_else(|| format!("query parameter '{}' must look like 'name=value'", value))?;
    Ok((name.to_string(), param.to_string()))
}

/// Builds the client configuration: file (or defaults), then flags.
fn build_config(options: &ConnectOptions<'_>) -> Result<ClientConfig> {
    let mut config = match options.config {
        Some(path) => ClientConfig::from_json_file(path)?,
        None => ClientConfig::default(),
    };

    if !options.hosts.is_empty() {
        config = config.with_hosts(options.hosts.iter().cloned());
    }
    if let Some(protocol) = options.protocol {
        config = config.with_protocol(protocol);
    }
    if let Some(api_key) = options.api_key {
        config = config.with_credentials(Credentials::with_api_key(api_key));
    } else if let Some(user) = options.user {
        config = config.with_credentials(Credentials::with_user(
            user,
            options.password.unwrap_or_default(),
        ));
    }

    config.validate()?;
    Ok(config)
}

fn build_request(args: &CallArgs) -> Result<Request> {
    let mut request = Request::new(args.method, args.path.clone());
    if let Some(tenant) = &args.tenant {
        request = request.with_tenant(tenant.clone());
    }
    if let Some(database) = &args.database {
        request = request.with_database(database.clone());
    }
    for (name, value) in &args.query {
        request = request.with_query_param(name.clone(), value.clone());
    }
    if let Some(body) = &args.body {
        serde_json::from_str::<serde_json::Value>(body).context("invalid JSON in --body")?;
        request = request
            .with_header("content-type", "application/json")
            .with_body(body.clone());
    }
    for (name, value) in &args.headers {
        request = request.with_header(name.clone(), value.clone());
    }
    Ok(request)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // call keeps stdout clean for piping
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Call(args) => run_call(args).await,
        Commands::Endpoints(args) => run_endpoints(args).await,
    }
}

/// Executes the `call` subcommand.
///
/// The body is printed exactly as received; non-2xx responses are errors.
async fn run_call(args: CallArgs) -> Result<()> {
    let config = build_config(&args.connect_options())?;
    let request = build_request(&args)?;

    let executor = Executor::builder(config).build()?;
    let result = executor.execute_raw(request).await;
    let _ = executor.disconnect();
    let response = result?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(response.body_bytes())?;
    if !response.body_bytes().ends_with(b"\n") {
        writeln!(stdout)?;
    }
    Ok(())
}

/// Executes the `endpoints` subcommand.
async fn run_endpoints(args: EndpointsArgs) -> Result<()> {
    let config = build_config(&args.connect_options())?;
    let interval_ms = config.acquire_host_list_interval_ms;
    let config = config.with_acquire_host_list(true, interval_ms);

    let executor = Executor::builder(config).build()?;
    let hosts = executor.discover_endpoints().await;
    let _ = executor.disconnect();
    let hosts = hosts?;

    tracing::info!(count = hosts.len(), "Discovered endpoints");
    for host in hosts.descriptions() {
        println!("{}", host);
    }
    Ok(())
}
