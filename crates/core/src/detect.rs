//! Template detection collaborator.

use std::path::PathBuf;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;

use crate::error::ActionError;
use crate::platform::{check_output, run_with_timeout};
use crate::types::{Detection, Frame, Point};

/// Locates a named template on a frame.
///
/// Implementations may return matches below `threshold`; [`find`] treats those
/// exactly like "not found".
pub trait Detector: Send + Sync {
    fn detect(&self, frame: &Frame, template: &str, threshold: f64) -> Result<Option<Detection>, ActionError>;
}

/// Detect `template` or explain why it is not usable.
pub fn find(detector: &dyn Detector, frame: &Frame, template: &str, threshold: f64) -> Result<Detection, ActionError> {
    match detector.detect(frame, template, threshold)? {
        Some(d) if d.confidence >= threshold => Ok(d),
        Some(d) => Err(ActionError::LowConfidence {
            template: template.to_string(),
            confidence: d.confidence,
            threshold,
        }),
        None => Err(ActionError::TemplateNotFound(template.to_string())),
    }
}

/// Random matches for `--stub` dry runs.
pub struct StubDetector {
    hit_rate: f64,
}

impl StubDetector {
    pub fn new(hit_rate: f64) -> Self {
        Self { hit_rate: hit_rate.clamp(0.0, 1.0) }
    }
}

impl Detector for StubDetector {
    fn detect(&self, frame: &Frame, _template: &str, threshold: f64) -> Result<Option<Detection>, ActionError> {
        let mut rng = rand::thread_rng();
        if !rng.gen_bool(self.hit_rate) {
            return Ok(None);
        }
        let w = frame.width.max(1) as i32;
        let h = frame.height.max(1) as i32;
        Ok(Some(Detection {
            at: Point::new(rng.gen_range(0..w), rng.gen_range(0..h)),
            confidence: rng.gen_range(threshold.min(0.99)..1.0),
        }))
    }
}

/// Runs an external matcher: `<program> <frame.png> <template.png> <threshold>`,
/// which prints `x y confidence` on a match and nothing otherwise.
pub struct CommandDetector {
    program: String,
    templates_dir: PathBuf,
    timeout: Duration,
    seq: AtomicU64,
}

impl CommandDetector {
    pub fn new(program: impl Into<String>, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            templates_dir: templates_dir.into(),
            timeout: Duration::from_secs(10),
            seq: AtomicU64::new(0),
        }
    }

    fn template_path(&self, template: &str) -> Option<PathBuf> {
        ["png", "jpg", "jpeg"]
            .iter()
            .map(|ext| self.templates_dir.join(format!("{}.{}", template, ext)))
            .find(|p| p.is_file())
    }
}

/// Parse `x y confidence`; blank output means no match.
pub fn parse_match(output: &str) -> Result<Option<Detection>, ActionError> {
    let line = output.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let parts: Vec<&str> = line.split_whitespace().collect();
    let bad = || ActionError::Detector(format!("unexpected detector output: {}", line));
    if parts.len() != 3 {
        return Err(bad());
    }
    let x = parts[0].parse::<f64>().map_err(|_| bad())?;
    let y = parts[1].parse::<f64>().map_err(|_| bad())?;
    let confidence = parts[2].parse::<f64>().map_err(|_| bad())?;
    Ok(Some(Detection { at: Point::new(x.round() as i32, y.round() as i32), confidence }))
}

impl Detector for CommandDetector {
    fn detect(&self, frame: &Frame, template: &str, threshold: f64) -> Result<Option<Detection>, ActionError> {
        let Some(template_path) = self.template_path(template) else {
            return Err(ActionError::Detector(format!(
                "no template image for '{}' in {}",
                template,
                self.templates_dir.display()
            )));
        };

        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        let frame_path = std::env::temp_dir().join(format!("tapfarm-{}-{}.png", std::process::id(), n));
        std::fs::write(&frame_path, &frame.data).map_err(|e| ActionError::Detector(e.to_string()))?;

        let mut cmd = Command::new(&self.program);
        cmd.arg(&frame_path).arg(&template_path).arg(format!("{:.3}", threshold));
        let result = run_with_timeout(cmd, self.timeout)
            .and_then(|out| check_output(&self.program, out))
            .map_err(|e| ActionError::Detector(e.to_string()));
        std::fs::remove_file(&frame_path).ok();

        parse_match(&String::from_utf8_lossy(&result?.stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Option<Detection>);

    impl Detector for Fixed {
        fn detect(&self, _: &Frame, _: &str, _: f64) -> Result<Option<Detection>, ActionError> {
            Ok(self.0)
        }
    }

    #[test]
    fn test_low_confidence_is_a_failure() {
        let d = Fixed(Some(Detection { at: Point::new(1, 1), confidence: 0.5 }));
        let err = find(&d, &Frame::default(), "btn", 0.8).unwrap_err();
        assert!(matches!(err, ActionError::LowConfidence { .. }));
    }

    #[test]
    fn test_match_at_threshold_is_found() {
        let d = Fixed(Some(Detection { at: Point::new(3, 4), confidence: 0.8 }));
        assert_eq!(find(&d, &Frame::default(), "btn", 0.8).unwrap().at, Point::new(3, 4));
    }

    #[test]
    fn test_missing_template_is_not_found() {
        let err = find(&Fixed(None), &Frame::default(), "btn", 0.8).unwrap_err();
        assert!(matches!(err, ActionError::TemplateNotFound(ref t) if t == "btn"));
    }

    #[test]
    fn test_parse_match() {
        assert_eq!(parse_match("  \n").unwrap(), None);
        let d = parse_match("120.4 33 0.91\n").unwrap().unwrap();
        assert_eq!(d.at, Point::new(120, 33));
        assert!((d.confidence - 0.91).abs() < 1e-9);
        assert!(parse_match("garbage").is_err());
    }

    #[test]
    fn test_stub_detector_respects_hit_rate_extremes() {
        let frame = Frame { data: Vec::new(), width: 100, height: 100 };
        assert!(StubDetector::new(0.0).detect(&frame, "x", 0.8).unwrap().is_none());
        let hit = StubDetector::new(1.0).detect(&frame, "x", 0.8).unwrap().unwrap();
        assert!(hit.confidence >= 0.8);
        assert!((0..100).contains(&hit.at.x));
    }
}
