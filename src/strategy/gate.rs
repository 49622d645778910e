//! Signal gate
//!
//! Decides whether an inbound signal may become an order: watchlist
//! membership, source toggles, instrument eligibility bounds, session hours
//! and duplicate suppression against positions the ledger already tracks.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};
use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::config::{EntryConfig, MarketHoursConfig};
use crate::domain::{Instrument, OptionContract, Position, Signal};
use crate::error::GateRejection;

/// Admit or reject `signal`.
///
/// `positions` is every position the ledger knows about; live ones always
/// suppress an equivalent signal, terminal ones only inside the configured
/// duplicate window.
pub fn admit<'a>(
    signal: &Signal,
    watchlist: &HashSet<String>,
    positions: impl IntoIterator<Item = &'a Position>,
    config: &EntryConfig,
    now: DateTime<Utc>,
) -> Result<(), GateRejection> {
    if !watchlist.contains(&signal.symbol.to_uppercase()) {
        return Err(GateRejection::NotInWatchlist {
            symbol: signal.symbol.clone(),
        });
    }

    if !config.source_enabled(&signal.source) {
        return Err(GateRejection::SourceDisabled {
            source_id: signal.source.clone(),
        });
    }

    if signal.strength < Decimal::ZERO || signal.strength > Decimal::ONE {
        return Err(GateRejection::InvalidStrength {
            strength: signal.strength,
        });
    }

    if config.max_signal_age_secs > 0 {
        let age_secs = (now - signal.timestamp).num_seconds();
        if age_secs > config.max_signal_age_secs as i64 {
            return Err(GateRejection::StaleSignal {
                age_secs,
                max_secs: config.max_signal_age_secs,
            });
        }
    }

    if config.market_hours.enforce && !session_open(&config.market_hours, now) {
        return Err(GateRejection::MarketClosed);
    }

    match &signal.instrument {
        Instrument::Equity => check_stock(signal, config)?,
        Instrument::Option(contract) => check_option(contract, config, now)?,
    }

    check_duplicates(signal, positions, config, now)
}

fn check_stock(signal: &Signal, config: &EntryConfig) -> Result<(), GateRejection> {
    let stocks = &config.stocks;
    if !stocks.enable {
        return Err(GateRejection::EquityTradingDisabled);
    }

    let price = signal
        .reference_price
        .ok_or(GateRejection::MissingMarketData {
            field: "reference_price",
        })?;
    if price < stocks.min_price || price > stocks.max_price {
        return Err(GateRejection::PriceOutOfRange {
            price,
            min: stocks.min_price,
            max: stocks.max_price,
        });
    }

    let volume = signal.market_volume.ok_or(GateRejection::MissingMarketData {
        field: "market_volume",
    })?;
    if volume < stocks.min_volume {
        return Err(GateRejection::VolumeTooLow {
            volume,
            min: stocks.min_volume,
        });
    }

    Ok(())
}

fn check_option(
    contract: &OptionContract,
    config: &EntryConfig,
    now: DateTime<Utc>,
) -> Result<(), GateRejection> {
    let options = &config.options;

    if !options.contract_types.contains(&contract.put_call) {
        return Err(GateRejection::ContractTypeDisabled {
            contract_type: contract.put_call.to_string(),
        });
    }

    // Puts carry negative delta; the bounds apply to its magnitude
    let delta = contract
        .delta
        .ok_or(GateRejection::MissingMarketData { field: "delta" })?
        .abs();
    if delta < options.min_delta || delta > options.max_delta {
        return Err(GateRejection::DeltaOutOfRange {
            delta,
            min: options.min_delta,
            max: options.max_delta,
        });
    }

    let days = contract.days_to_expiration(now.date_naive());
    if days < options.days_to_expiration_min || days > options.days_to_expiration_max {
        return Err(GateRejection::ExpirationOutOfRange {
            days,
            min: options.days_to_expiration_min,
            max: options.days_to_expiration_max,
        });
    }

    let volume = contract
        .volume
        .ok_or(GateRejection::MissingMarketData { field: "volume" })?;
    if volume < options.min_volume {
        return Err(GateRejection::VolumeTooLow {
            volume,
            min: options.min_volume,
        });
    }

    let open_interest = contract.open_interest.ok_or(GateRejection::MissingMarketData {
        field: "open_interest",
    })?;
    if open_interest < options.min_open_interest {
        return Err(GateRejection::OpenInterestTooLow {
            open_interest,
            min: options.min_open_interest,
        });
    }

    Ok(())
}

fn check_duplicates<'a>(
    signal: &Signal,
    positions: impl IntoIterator<Item = &'a Position>,
    config: &EntryConfig,
    now: DateTime<Utc>,
) -> Result<(), GateRejection> {
    let window = config.duplicate_window();
    let within_window =
        |p: &Position| config.duplicate_window_secs > 0 && now - p.opened_at < window;

    let duplicate = positions.into_iter().any(|p| {
        p.symbol.eq_ignore_ascii_case(&signal.symbol)
            && p.instrument.equivalent(&signal.instrument)
            && (p.status.is_live() || within_window(p))
    });

    if duplicate {
        return Err(GateRejection::DuplicatePosition {
            instrument: signal.key(),
        });
    }
    Ok(())
}

/// Whether `now` falls inside the configured trading session
pub fn session_open(hours: &MarketHoursConfig, now: DateTime<Utc>) -> bool {
    let Some(offset) = FixedOffset::east_opt(hours.utc_offset_minutes * 60) else {
        return false;
    };
    let local = now.with_timezone(&offset);

    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }

    let pre_market_open = NaiveTime::from_hms_opt(4, 0, 0).unwrap_or(hours.open);
    let after_hours_close = NaiveTime::from_hms_opt(20, 0, 0).unwrap_or(hours.close);

    let open = if hours.pre_market_enable {
        pre_market_open
    } else {
        hours.open
    };
    let close = if hours.after_hours_enable {
        after_hours_close
    } else {
        hours.close
    };

    let time = local.time();
    time >= open && time < close
}
