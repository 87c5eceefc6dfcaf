//! Result classification

use watchtower_core::{Error, HealthCondition, Result, ResultData, Status};

/// Map a run's table onto a status under the monitor's health condition
pub fn classify(data: &ResultData, health_condition: HealthCondition) -> Status {
    if data.is_error() || data.columns.is_empty() {
        return Status::ConnectionError;
    }
    let empty = data.data.is_empty();
    match health_condition {
        HealthCondition::EmptyResults if empty => Status::Healthy,
        HealthCondition::EmptyResults => Status::Triggered,
        HealthCondition::ReturnResults if empty => Status::Triggered,
        HealthCondition::ReturnResults => Status::Healthy,
    }
}

/// Downgrade healthy and triggered runs whose unfiltered variant found
/// nothing at all
pub fn apply_no_data(status: Status, unfiltered_has_rows: bool) -> Status {
    match status {
        Status::Healthy | Status::Triggered if !unfiltered_has_rows => Status::NoDataDetected,
        other => other,
    }
}

/// Combine the statuses of per-account runs.
///
/// Any triggered account triggers the monitor; otherwise a healthy account
/// makes it healthy; otherwise it failed to connect.
pub fn aggregate<I>(statuses: I) -> Status
where
    I: IntoIterator<Item = Status>,
{
    let mut healthy = false;
    for status in statuses {
        match status {
            Status::Triggered => return Status::Triggered,
            Status::Healthy => healthy = true,
            _ => {}
        }
    }
    if healthy {
        Status::Healthy
    } else {
        Status::ConnectionError
    }
}

/// Replace results above the byte limit by an error marker.
///
/// Returns the data to persist and whether it was replaced.
pub fn enforce_size(data: ResultData, limit: usize) -> Result<(ResultData, bool)> {
    let size = data.serialized_len()?;
    if size <= limit {
        return Ok((data, false));
    }
    let marker = Error::ResultTooLarge { size, limit }.to_string();
    Ok((ResultData::from_error(marker), true))
}
