use crate::config::PRICE_EPSILON;
use crate::error::{AppError, Result};
use crate::types::{Movement, PriceChangeEvent, PriceQuote, PriceState};

/// Outcome of applying one observation to the stored state for its key.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// First observation of the key.
    Created(PriceState),
    /// The price moved by at least the noise floor.
    Changed {
        state: PriceState,
        change: PriceChangeEvent,
    },
    /// Same price, or a move inside the noise floor. Stored state is returned as-is.
    Unchanged(PriceState),
}

impl Transition {
    pub fn into_state(self) -> PriceState {
        match self {
            Transition::Created(s) | Transition::Unchanged(s) => s,
            Transition::Changed { state, .. } => state,
        }
    }
}

/// Rejects non-finite and non-positive prices.
pub fn validate_price(price: f64) -> Result<f64> {
    if !price.is_finite() {
        return Err(AppError::InvalidPrice(format!("price is not a finite number: {price}")));
    }
    if price <= 0.0 {
        return Err(AppError::InvalidPrice(format!("price must be positive, got {price}")));
    }
    Ok(price)
}

/// Computes the next state for `quote.key` given the stored state (if any).
///
/// Pure: the caller is responsible for running this against the state read inside
/// the same write transaction it persists the result in.
pub fn apply_observation(
    prior: Option<&PriceState>,
    quote: &PriceQuote,
    noise_floor: f64,
) -> Result<Transition> {
    let observed = validate_price(quote.price)?;

    let Some(prior) = prior else {
        return Ok(Transition::Created(first_observation(quote, observed)));
    };

    let previous = prior.current_price;
    let delta = observed - previous;
    if delta.abs() <= PRICE_EPSILON || delta.abs() + PRICE_EPSILON < noise_floor {
        return Ok(Transition::Unchanged(prior.clone()));
    }

    let direction = if observed < previous {
        Movement::Shortening
    } else {
        Movement::Lengthening
    };
    let pct = movement_pct(previous, observed);

    let state = PriceState {
        key: prior.key.clone(),
        initial_price: prior.initial_price,
        previous_price: Some(previous),
        current_price: observed,
        change_count: prior.change_count + 1,
        last_change_at: Some(quote.observed_at),
        movement: direction,
        movement_pct: Some(pct),
        first_seen_at: prior.first_seen_at,
    };
    let change = PriceChangeEvent {
        id: None,
        key: prior.key.clone(),
        from_price: previous,
        to_price: observed,
        delta,
        delta_pct: pct,
        direction,
        observed_at: quote.observed_at,
    };

    Ok(Transition::Changed { state, change })
}

/// `100 * (to - from) / from`. `from` is always a validated positive price.
pub fn movement_pct(from: f64, to: f64) -> f64 {
    100.0 * (to - from) / from
}

fn first_observation(quote: &PriceQuote, price: f64) -> PriceState {
    PriceState {
        key: quote.key.clone(),
        initial_price: price,
        previous_price: None,
        current_price: price,
        change_count: 0,
        last_change_at: None,
        movement: Movement::Stable,
        movement_pct: None,
        first_seen_at: quote.observed_at,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
