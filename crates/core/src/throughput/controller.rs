use std::time::Duration;

use crate::{
    config::{
        DEFAULT_BAD_ROUND_LIMIT, DEFAULT_INITIAL_RATE, DEFAULT_RATE_STEP, DEFAULT_TOLERANCE,
        DEFAULT_WINDOW_CAPACITY,
    },
    diary::{Diary, RatePoint, RoundRecord},
    participant::Roster,
};

use super::{window::SlidingWindow, Response, RoundReport, ThroughputError, NANOS_PER_SEC};

/// Tuning of the saturation search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerSettings {
    /// Wall-clock length of the load period clients run between two rounds.
    pub period_length: Duration,
    /// Offered rate (messages per second, across all publishers) of the first period.
    pub initial_rate: f64,
    /// Secant below which the system is considered saturated.
    pub tolerance: f64,
    /// Gain applied to the secant when raising the offered rate.
    pub rate_step: f64,
    /// Consecutive rounds without throughput tolerated before giving up.
    pub bad_round_limit: u32,
    pub window_capacity: usize,
}

impl ControllerSettings {
    pub fn new(period_length: Duration) -> Self {
        Self {
            period_length,
            initial_rate: DEFAULT_INITIAL_RATE,
            tolerance: DEFAULT_TOLERANCE,
            rate_step: DEFAULT_RATE_STEP,
            bad_round_limit: DEFAULT_BAD_ROUND_LIMIT,
            window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

/// Inter-message delay, in nanoseconds, each publisher must keep so that all
/// of them together offer `offered_rate` messages per second.
pub fn pacing_delay_ns(offered_rate: f64, num_publishers: usize) -> u64 {
    let per_publisher_rate = offered_rate / num_publishers as f64;
    let secs_per_message = 1.0 / per_publisher_rate;
    (secs_per_message * NANOS_PER_SEC) as u64
}

#[derive(Debug, Clone)]
struct ControllerState {
    round: u32,
    offered_rate: f64,
    pacing_delay_ns: u64,
    history: SlidingWindow,
    consecutive_bad_rounds: u32,
    running: bool,
    final_throughput: f64,
}

/// Decides, round after round, whether to raise the offered rate or to
/// declare the system saturated.
///
/// The slope of the throughput-vs-rate curve is approximated by the secant
/// between the oldest point of a sliding window and the current round. While
/// added load still buys throughput the offered rate is raised proportionally
/// to that slope; once the slope falls under the tolerance the smoothed
/// throughput of the window is the result of the experiment.
#[derive(Debug, Clone)]
pub struct RateController {
    settings: ControllerSettings,
    num_publishers: usize,
    num_subscribers: usize,
    state: ControllerState,
}

impl RateController {
    pub fn new(settings: ControllerSettings, roster: &Roster) -> Self {
        let num_publishers = roster.num_publishers();
        Self {
            state: ControllerState {
                round: 0,
                offered_rate: settings.initial_rate,
                pacing_delay_ns: pacing_delay_ns(settings.initial_rate, num_publishers),
                history: SlidingWindow::new(settings.window_capacity),
                consecutive_bad_rounds: 0,
                running: true,
                final_throughput: f64::NAN,
            },
            settings,
            num_publishers,
            num_subscribers: roster.num_subscribers(),
        }
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    pub fn round(&self) -> u32 {
        self.state.round
    }

    pub fn offered_rate(&self) -> f64 {
        self.state.offered_rate
    }

    pub fn pacing_delay_ns(&self) -> u64 {
        self.state.pacing_delay_ns
    }

    pub fn consecutive_bad_rounds(&self) -> u32 {
        self.state.consecutive_bad_rounds
    }

    pub fn is_running(&self) -> bool {
        self.state.running
    }

    /// NaN until the experiment converged.
    pub fn final_throughput(&self) -> f64 {
        self.state.final_throughput
    }

    /// The answer every client receives for the current round.
    pub fn decision(&self) -> Response {
        if self.state.running {
            Response::Continue {
                pacing_delay_ns: self.state.pacing_delay_ns,
            }
        } else {
            Response::Stop
        }
    }

    pub fn finish_round(&mut self) {
        self.state.round += 1;
    }

    fn is_saturated(&self, secant: f64) -> bool {
        secant < self.settings.tolerance
    }

    fn update_offered_rate(&mut self, secant: f64) {
        self.state.offered_rate += self.settings.rate_step * secant;
        self.state.pacing_delay_ns = pacing_delay_ns(self.state.offered_rate, self.num_publishers);
        tracing::debug!(
            offered_rate = self.state.offered_rate,
            publishers = self.num_publishers,
            pacing_delay_ns = self.state.pacing_delay_ns,
            "Offered rate updated"
        );
    }

    /// Evaluates the reports of the current round.
    ///
    /// Must not be called for the bootstrap round 0, which has no previous
    /// load period to measure.
    pub fn step(&mut self, reports: &[RoundReport]) -> Result<RoundRecord, ThroughputError> {
        let round = self.state.round;
        debug_assert!(round > 0, "the bootstrap round is never evaluated");

        let mut delivered_count: u64 = 0;
        for report in reports {
            delivered_count = delivered_count
                .checked_add(report.messages_delivered)
                .ok_or_else(|| ThroughputError::DeliveredOverflow {
                    round,
                    client: report.client_name.clone(),
                    delivered: report.messages_delivered,
                })?;
        }
        let delay_sum: f64 = reports.iter().map(|r| r.average_delivery_delay).sum();
        let round_latency = delay_sum / self.num_subscribers as f64;

        // The denominator grows with the round count while the numerator only
        // holds the deliveries of the last period.
        let elapsed_secs = round as f64 * self.settings.period_length.as_secs_f64();
        let current_throughput = delivered_count as f64 / elapsed_secs;
        let offered_rate = self.state.offered_rate;
        tracing::info!(
            round,
            current_throughput,
            delivered_count,
            elapsed_secs,
            "Round throughput"
        );

        let mut record = RoundRecord {
            round,
            offered_rate,
            delivered_count,
            round_latency,
            current_throughput,
            current_ratio: None,
            secant: None,
            window_start: None,
            window_end: None,
            moving_average: None,
        };

        if current_throughput <= 0.0 {
            self.state.consecutive_bad_rounds += 1;
            tracing::warn!(
                round,
                bad_rounds = self.state.consecutive_bad_rounds,
                "No throughput measured this round"
            );
            if self.state.consecutive_bad_rounds > self.settings.bad_round_limit {
                tracing::error!(
                    round,
                    limit = self.settings.bad_round_limit,
                    "Too many rounds without throughput, experiment inconclusive"
                );
                self.state.running = false;
                self.state.final_throughput = f64::NAN;
                record.moving_average = Some(f64::NAN);
            }
            return Ok(record);
        }

        let start = self
            .state
            .history
            .take_start()
            .ok_or(ThroughputError::EmptyWindow { round })?;
        let end = RatePoint::new(offered_rate, current_throughput);
        let secant = (end.y - start.y) / (end.x - start.x);
        let current_ratio = current_throughput / offered_rate;
        let moving_average = self.state.history.mean_throughput();
        tracing::info!(
            round,
            secant,
            start_x = start.x,
            start_y = start.y,
            moving_average,
            "Secant computed"
        );

        record.current_ratio = Some(current_ratio);
        record.secant = Some(secant);
        record.window_start = Some(start);
        record.window_end = Some(end);
        record.moving_average = Some(moving_average);

        if !secant.is_finite() {
            return Err(ThroughputError::UndefinedSecant { round, start, end });
        }
        if self.is_saturated(secant) {
            tracing::info!(round, final_throughput = moving_average, "Saturation reached");
            self.state.running = false;
            self.state.final_throughput = moving_average;
        } else {
            self.state.history.push(end);
            self.update_offered_rate(secant);
        }
        Ok(record)
    }
}

/// Feeds recorded per-round reports (starting with the bootstrap round 0)
/// through a fresh controller, the same way the master does.
///
/// The returned diary is only finished if the controller stopped before the
/// reports ran out.
pub fn replay<I>(
    settings: ControllerSettings,
    roster: &Roster,
    rounds: I,
) -> Result<Diary, ThroughputError>
where
    I: IntoIterator,
    I::Item: AsRef<[RoundReport]>,
{
    let mut controller = RateController::new(settings, roster);
    let mut diary = Diary::new();
    for reports in rounds {
        if controller.round() != 0 {
            diary.record_round(controller.step(reports.as_ref())?);
        }
        controller.finish_round();
        if !controller.is_running() {
            diary.finish(controller.final_throughput());
            break;
        }
    }
    Ok(diary)
}
