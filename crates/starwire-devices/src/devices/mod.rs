/*!
 * Reference drivers.
 *
 * A rain detector and a dome that closes itself when the detector raises
 * an alert, showing property definition, polling timers and snooping.
 */

pub mod dome;
pub mod rain_detector;

pub use dome::Dome;
pub use rain_detector::RainDetector;
