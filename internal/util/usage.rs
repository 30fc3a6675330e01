const USAGE: &str = "\
Message Reassembly Service — fragment reassembly and exactly-once forwarding

USAGE:
    mrs [OPTIONS]

OPTIONS:
    -h, --help           Print this help message and exit
    -v, --version        Print version and exit
        --migrate-only   Run database migrations and exit

REQUIRED ENVIRONMENT VARIABLES:
    MRS_INGEST_MODE              http | queue | object-events | stream
    MRS_POSTGRES_DSN             PostgreSQL connection string
    MRS_SINK_URL                 Scoring sink base URL
    MRS_SINK_TOKEN               Sink auth token [change-me; blocked unless insecure dev]

INGESTION CHANNELS:
    MRS_QUEUE_URL                AMQP broker URL (queue and object-events modes)
    MRS_QUEUE_NAME               Fragment queue name            [fragments]
    MRS_OBJECT_STORE_URL         Object store base URL (object-events mode)
    MRS_OBJECT_STORE_TOKEN       Object store bearer token
    MRS_OBJECT_EVENTS_QUEUE      Object event queue name        [fragment-events]
    MRS_STREAM_URL               Stream endpoint base URL (stream mode)
    MRS_STREAM_ID                Stream to tail                 [fragments]
    MRS_POLL_BATCH               Max deliveries per poll        [10]
    MRS_POLL_IDLE_MS             Sleep between empty polls      [2000]

NETWORK (listen addresses, default shown):
    MRS_HTTP_LISTEN              Fragment push endpoint         [:8080]
    MRS_METRICS_LISTEN           Prometheus metrics / status    [:9100]

OTHER:
    MRS_FORWARD_TIMEOUT_SECONDS  Sink request timeout           [10]
    MRS_STORE_TIMEOUT_SECONDS    Store call timeout             [5]
    MRS_POSTGRES_CONNECT_RETRIES Startup connect attempts       [30]
    MRS_POSTGRES_CONNECT_DELAY_MS Delay between attempts        [1000]
    MRS_MIGRATIONS_DIR           Migrations directory override
    MRS_LOG_LEVEL                Log level                      [info]
    MRS_INSECURE_DEV             Relax secret validation        [false]";

/// Handles `--help`/`--version`; returns true when the process should exit.
pub fn handle_cli_flags(version: &str) -> bool {
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "-h" | "--help" => {
                println!("{USAGE}");
                return true;
            }
            "-v" | "--version" => {
                println!("mrs {version}");
                return true;
            }
            _ => {}
        }
    }
    false
}
