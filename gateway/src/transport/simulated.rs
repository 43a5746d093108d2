use super::DeviceLink;
use crate::errors::TransportError;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Stand-in for the wearable that emits plausible device lines, so the
/// pipeline can run without hardware.
pub struct SimulatedLink {
    interval: Duration,
    rng: StdRng,
    open: bool,
}

impl SimulatedLink {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            rng: StdRng::from_entropy(),
            open: false,
        }
    }
}

#[async_trait]
impl DeviceLink for SimulatedLink {
    fn describe(&self) -> String {
        format!("simulated device every {:?}", self.interval)
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        self.open = true;
        Ok(())
    }

    async fn next_lines(&mut self) -> Result<Vec<String>, TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        tokio::time::sleep(self.interval).await;
        Ok(vec![generate_line(&mut self.rng)])
    }

    async fn close(&mut self) {
        self.open = false;
    }
}

fn generate_line(rng: &mut impl Rng) -> String {
    if rng.gen_bool(0.02) {
        // Finger off the sensor
        return format!("FC:0 SpO2:0 IR:{}", rng.gen_range(500..5_000));
    }

    let heart_rate: u32 = if rng.gen_bool(0.05) {
        rng.gen_range(121..160) // 5% tachycardia
    } else {
        rng.gen_range(55..95)
    };

    let spo2: u32 = if rng.gen_bool(0.05) {
        rng.gen_range(82..90) // 5% desaturation
    } else {
        rng.gen_range(94..=100)
    };

    let temperature: f64 = rng.gen_range(35.8..37.4);
    let infrared: u32 = rng.gen_range(50_000..120_000);

    format!(
        "FC:{} SpO2:{} Temp:{:.2} IR:{}",
        heart_rate, spo2, temperature, infrared
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_tags;

    #[test]
    fn test_generated_lines_parse() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let line = generate_line(&mut rng);
            let update = parse_tags(&line);
            assert!(update.heart_rate.is_some(), "line: {}", line);
            assert!(update.spo2.is_some_and(|v| v <= 100), "line: {}", line);
            assert!(update.infrared.is_some(), "line: {}", line);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_one_line_per_interval() {
        let mut link = SimulatedLink::new(Duration::from_millis(500));
        assert!(matches!(link.next_lines().await, Err(TransportError::Closed)));

        link.open().await.unwrap();
        let lines = link.next_lines().await.unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("FC:"));
    }
}
