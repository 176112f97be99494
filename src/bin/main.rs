// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use chrono::Local;
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use dispatch_ledger_rs::{
    Call, CallId, CreditLedger, DailyCloseout, DispatchError, DispatchStore, Dispatcher, DriverId,
    DriverStatus, LogNotifier, OfficeId, PaymentMethod, RegionId, SessionCtx, Settlement,
    SettlementLedger, SettlementTrigger, TripLifecycle, derive_customer_key,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Dispatch Ledger - replay a day's dispatch events
///
/// Reads call events from a CSV file, runs them through the coordination
/// core, and writes the resulting settlement ledger to stdout.
#[derive(Parser, Debug)]
#[command(name = "dispatch-ledger-rs")]
#[command(about = "Replays dispatch event CSVs through the coordination core", long_about = None)]
struct Args {
    /// Path to CSV file with dispatch events
    ///
    /// Expected format: event,call,driver,customer,phone,departure,destination,amount,cash,method
    /// Events: driver, open, assign, accept, start, complete, settle, pay, finalize
    #[arg(value_name = "FILE")]
    input: PathBuf,
}

/// All replayed events land in one office.
const REGION: &str = "region-1";
const OFFICE: &str = "office-1";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let engine = Engine::new();
    let trigger_task = SettlementTrigger::new(engine.store.clone(), engine.settlements.clone()).spawn();
    // Let the trigger subscribe before the first event lands.
    tokio::task::yield_now().await;

    if let Err(e) = replay_events(&engine, BufReader::new(file)).await {
        eprintln!("Error replaying events: {}", e);
        process::exit(1);
    }

    if let Err(e) = write_settlements(&engine, std::io::stdout()) {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }

    trigger_task.abort();
}

/// The wired-up coordination core.
struct Engine {
    store: Arc<DispatchStore>,
    dispatcher: Dispatcher,
    trips: TripLifecycle,
    settlements: Arc<SettlementLedger>,
    credits: Arc<CreditLedger>,
    closeout: DailyCloseout,
}

impl Engine {
    fn new() -> Self {
        let store = DispatchStore::new();
        let settlements = Arc::new(SettlementLedger::new(store.clone()));
        let credits = Arc::new(CreditLedger::new(store.clone()));
        Self {
            dispatcher: Dispatcher::new(store.clone(), Arc::new(LogNotifier::new())),
            trips: TripLifecycle::new(store.clone(), settlements.clone(), credits.clone()),
            closeout: DailyCloseout::new(store.clone()),
            settlements,
            credits,
            store,
        }
    }

    fn session(&self, driver: &str) -> SessionCtx {
        SessionCtx::new(
            DriverId::from(driver),
            RegionId::from(REGION),
            OfficeId::from(OFFICE),
        )
    }
}

/// Raw CSV record matching the input format.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    event: String,
    #[serde(default)]
    call: String,
    #[serde(default)]
    driver: String,
    #[serde(default)]
    customer: String,
    #[serde(default)]
    phone: String,
    #[serde(default)]
    departure: String,
    #[serde(default)]
    destination: String,
    #[serde(deserialize_with = "csv::invalid_option", default)]
    amount: Option<Decimal>,
    #[serde(deserialize_with = "csv::invalid_option", default)]
    cash: Option<Decimal>,
    #[serde(default)]
    method: String,
}

/// Applies one event. Domain errors (conflicts, validation) are returned so
/// the caller can log and continue; they never halt the replay.
async fn apply_event(engine: &Engine, record: &CsvRecord) -> Result<(), DispatchError> {
    match record.event.to_lowercase().as_str() {
        "driver" => {
            let driver = DriverStatus::new(
                DriverId::from(record.driver.as_str()),
                RegionId::from(REGION),
                OfficeId::from(OFFICE),
            );
            engine.store.drivers.put(record.driver.as_str(), driver);
            Ok(())
        }
        "open" => {
            let call = Call::new(
                CallId::from(record.call.as_str()),
                RegionId::from(REGION),
                OfficeId::from(OFFICE),
                record.customer.clone(),
                record.phone.clone(),
                record.departure.clone(),
                record.destination.clone(),
            );
            engine.dispatcher.open_call(call).await
        }
        "assign" => {
            let session = engine.session(&record.driver);
            engine
                .dispatcher
                .assign(&CallId::from(record.call.as_str()), &session)
                .await?;
            Ok(())
        }
        "accept" => {
            let session = engine.session(&record.driver);
            engine
                .trips
                .accept(&CallId::from(record.call.as_str()), &session)
                .await?;
            Ok(())
        }
        "start" => {
            let session = engine.session(&record.driver);
            let fare = record
                .amount
                .ok_or_else(|| DispatchError::Validation("start requires an amount".into()))?;
            engine
                .trips
                .start(
                    &CallId::from(record.call.as_str()),
                    &session,
                    &record.departure,
                    &record.destination,
                    Vec::new(),
                    fare,
                )
                .await?;
            Ok(())
        }
        "complete" => {
            let session = engine.session(&record.driver);
            engine
                .trips
                .complete(&CallId::from(record.call.as_str()), &session)
                .await?;
            Ok(())
        }
        "settle" => {
            let session = engine.session(&record.driver);
            let method = PaymentMethod::parse(&record.method)
                .ok_or_else(|| DispatchError::Validation("unknown payment method".into()))?;
            let fare = record
                .amount
                .ok_or_else(|| DispatchError::Validation("settle requires an amount".into()))?;
            let cash = record.cash.unwrap_or(Decimal::ZERO);
            engine
                .trips
                .confirm_settlement(
                    &CallId::from(record.call.as_str()),
                    &session,
                    method,
                    cash,
                    fare,
                    "",
                )
                .await?;
            Ok(())
        }
        "pay" => {
            let key = derive_customer_key(&record.customer, &record.phone);
            let amount = record
                .amount
                .ok_or_else(|| DispatchError::Validation("pay requires an amount".into()))?;
            engine.credits.decrement(&key, amount)?;
            Ok(())
        }
        "finalize" => {
            engine
                .closeout
                .finalize(
                    &RegionId::from(REGION),
                    &OfficeId::from(OFFICE),
                    Local::now().naive_local(),
                )
                .await?;
            Ok(())
        }
        other => Err(DispatchError::Validation(format!("unknown event '{other}'"))),
    }
}

/// Replays events from a CSV reader in order.
///
/// Malformed rows are skipped; per-event domain errors are logged to stderr
/// and don't stop processing, matching how a live system treats conflicts.
async fn replay_events<R: Read>(engine: &Engine, reader: R) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for result in rdr.deserialize::<CsvRecord>() {
        match result {
            Ok(record) => {
                if let Err(e) = apply_event(engine, &record).await {
                    eprintln!("Skipping event '{}' for call '{}': {}", record.event, record.call, e);
                }
            }
            Err(e) => {
                eprintln!("Skipping malformed row: {}", e);
                continue;
            }
        }
    }

    Ok(())
}

/// Settlement row in the output report.
#[derive(Debug, Serialize)]
struct SettlementRow {
    call: String,
    driver: String,
    fare: Decimal,
    method: String,
    cash: Decimal,
    credit: Decimal,
    status: String,
    finalized: bool,
    work_date: String,
}

impl From<&Settlement> for SettlementRow {
    fn from(s: &Settlement) -> Self {
        Self {
            call: s.call_id.to_string(),
            driver: s.driver_id.to_string(),
            fare: s.fare,
            method: s.payment_method.to_string(),
            cash: s.cash_amount,
            credit: s.credit_amount,
            status: format!("{:?}", s.settlement_status).to_uppercase(),
            finalized: s.is_finalized,
            work_date: s.work_date.clone(),
        }
    }
}

/// Writes the full settlement ledger as CSV, oldest first.
fn write_settlements<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut settlements = engine.store.settlements.filter(|_| true);
    settlements.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    for settlement in &settlements {
        wtr.serialize(SettlementRow::from(settlement))?;
    }

    wtr.flush()?;
    Ok(())
}
