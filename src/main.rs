use std::path::PathBuf;

use clap::Parser;
use saml_sp::{
    InboundMessage, Settings, SpConfig,
    config::LoggingConfig,
    message::{MessageKind, Status, issuer},
    metadata, observability,
    xml::Document,
};

const DEFAULT_CONFIG_PATH: &str = "saml-sp.toml";

#[derive(Parser, Debug)]
#[command(version, about = "SAML 2.0 Service Provider tooling", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file (defaults to ./saml-sp.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Export the SP metadata XML
    Metadata {
        /// Output file path (defaults to stdout)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Load and validate the configuration, then exit
    Check,
    /// Decode a SAML message and print its XML
    Decode {
        /// Raw query string of an HTTP-Redirect message
        #[arg(long, conflicts_with = "post", required_unless_present = "post")]
        redirect: Option<String>,
        /// Base64 `SAMLRequest`/`SAMLResponse` form value of an HTTP-POST message
        #[arg(long)]
        post: Option<String>,
    },
}

fn main() {
    let args = Args::parse();

    match args.command {
        Command::Metadata { output } => run_metadata_export(args.config.as_deref(), output),
        Command::Check => run_check(args.config.as_deref()),
        Command::Decode { redirect, post } => run_decode(redirect, post),
    }
}

fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    PathBuf::from(explicit.unwrap_or(DEFAULT_CONFIG_PATH))
}

/// Load the config, start tracing and build validated settings, exiting on
/// any failure.
fn load_settings(explicit_config_path: Option<&str>) -> Settings {
    let config_path = resolve_config_path(explicit_config_path);
    let config = match SpConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                config_path.display(),
                e
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::init_tracing(&config.logging) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    match Settings::from_config(&config) {
        Ok(settings) => {
            tracing::debug!(config_file = %config_path.display(), "Settings loaded");
            settings
        }
        Err(e) => {
            eprintln!("Invalid settings in {}: {}", config_path.display(), e);
            std::process::exit(1);
        }
    }
}

fn run_metadata_export(config_path: Option<&str>, output: Option<String>) {
    let settings = load_settings(config_path);
    let xml = match metadata::generate_checked(&settings) {
        Ok(xml) => xml,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &xml) {
                eprintln!("Failed to write to {}: {}", path, e);
                std::process::exit(1);
            }
            eprintln!("Metadata written to {} ({})", path, metadata::CONTENT_TYPE);
        }
        None => {
            println!("{}", xml);
        }
    }
}

fn run_check(config_path: Option<&str>) {
    let settings = load_settings(config_path);
    let security = settings.security();

    println!("SP entity ID:    {}", settings.sp_entity_id());
    println!("ACS URL:         {}", settings.acs_url());
    println!("SLS URL:         {}", settings.sls_url().unwrap_or("-"));
    println!("IdP entity ID:   {}", settings.idp_entity_id());
    println!("IdP SSO URL:     {}", settings.idp_sso_url().unwrap_or("-"));
    println!("IdP SLO URL:     {}", settings.idp_slo_url().unwrap_or("-"));
    println!("IdP certificates: {}", settings.idp_certificates().len());
    println!(
        "Signing:         {}",
        settings
            .signing_credentials()
            .map(|c| c.signature_algorithm.uri())
            .unwrap_or("disabled")
    );
    println!("Signed assertions required: {}", security.want_assertions_signed);
    println!("Signed messages required:   {}", security.want_messages_signed);
    println!("Encrypted assertions required: {}", security.want_assertions_encrypted);
    println!("Configuration OK");
}

fn run_decode(redirect: Option<String>, post: Option<String>) {
    if let Err(e) = observability::init_tracing(&LoggingConfig::default()) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }

    let message = match (redirect, post) {
        (Some(query), _) => {
            let query = query.trim_start_matches('?');
            match InboundMessage::from_query(query) {
                Ok(message) => message,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        (None, Some(payload)) => InboundMessage::from_post(payload, None),
        (None, None) => {
            eprintln!("Error: one of --redirect or --post is required");
            std::process::exit(2);
        }
    };

    let xml = match message.decode_xml() {
        Ok(xml) => xml,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Ok(document) = Document::parse(&xml) {
        let root = document.root();
        if let Some(kind) = MessageKind::of(root) {
            eprintln!("Message:     {}", kind.as_str());
        }
        if let Some(id) = root.attr("ID") {
            eprintln!("ID:          {}", id);
        }
        if let Some(issuer) = issuer(root) {
            eprintln!("Issuer:      {}", issuer);
        }
        if let Ok(status) = Status::parse(root) {
            eprintln!("Status:      {}", status.code);
        }
        if let Some(relay_state) = message.relay_state() {
            eprintln!("RelayState:  {}", relay_state);
        }
    }

    println!("{}", xml);
}
