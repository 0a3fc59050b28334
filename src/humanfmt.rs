#[must_use]
pub(crate) enum HumanFmt {
    Size(u64),
    Rate(u64, std::time::Duration),
    Time(std::time::Duration),
}

impl std::fmt::Display for HumanFmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[inline]
        #[must_use]
        const fn precision(value: f64) -> usize {
            if value > 100.0 {
                0
            } else if value > 10.0 {
                1
            } else {
                2
            }
        }

        #[expect(clippy::cast_precision_loss)]
        match *self {
            Self::Size(bytes) => {
                if bytes < 1000 {
                    return f.write_fmt(format_args!("{bytes}B"));
                }
                let mut size = bytes as f64;
                for unit in ["kB", "MB", "GB"] {
                    size /= 1000.0;
                    if size < 1000.0 {
                        return f.write_fmt(format_args!("{size:.0$}{unit}", precision(size)));
                    }
                }
                let size = size / 1000.0;
                f.write_fmt(format_args!("{size:.0$}TB", precision(size)))
            }
            Self::Rate(bytes, time) => {
                let secs = time.as_secs_f64();
                if secs == 0.0 {
                    return f.write_fmt(format_args!("???B/s"));
                }
                let mut rate = bytes as f64 / secs;
                if rate < 1000.0 {
                    return f.write_fmt(format_args!("{rate:.0}B/s"));
                }
                for unit in ["kB/s", "MB/s", "GB/s"] {
                    rate /= 1000.0;
                    if rate < 1000.0 {
                        return f.write_fmt(format_args!("{rate:.0$}{unit}", precision(rate)));
                    }
                }
                let rate = rate / 1000.0;
                f.write_fmt(format_args!("{rate:.0$}TB/s", precision(rate)))
            }
            Self::Time(time) => {
                let nanos = time.as_nanos();
                if nanos < 1000 {
                    return f.write_fmt(format_args!("{nanos}ns"));
                }
                let mut t = nanos as f64;
                for unit in ["us", "ms"] {
                    t /= 1000.0;
                    if t < 1000.0 {
                        return f.write_fmt(format_args!("{t:.0$}{unit}", precision(t)));
                    }
                }
                let t = t / 1000.0;
                if t < 600.0 {
                    return f.write_fmt(format_args!("{t:.0$}s", precision(t)));
                }
                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let t = t as u64;
                let secs = t % 60;
                let mins = (t / 60) % 60;
                let hours = t / 3600;
                if hours != 0 {
                    f.write_fmt(format_args!("{hours}h{mins}m{secs}s"))
                } else {
                    f.write_fmt(format_args!("{mins}m{secs}s"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HumanFmt;

    #[test]
    fn format_size() {
        assert_eq!(HumanFmt::Size(0).to_string(), "0B");
        assert_eq!(HumanFmt::Size(999).to_string(), "999B");
        assert_eq!(HumanFmt::Size(1000).to_string(), "1.00kB");
        assert_eq!(HumanFmt::Size(1_048_576).to_string(), "1.05MB");
        assert_eq!(HumanFmt::Size(123_456_789_000).to_string(), "123GB");
    }

    #[test]
    fn format_time() {
        assert_eq!(HumanFmt::Time(Duration::from_nanos(12)).to_string(), "12ns");
        assert_eq!(HumanFmt::Time(Duration::from_micros(999)).to_string(), "999us");
        assert_eq!(HumanFmt::Time(Duration::from_millis(1500)).to_string(), "1.50s");
        assert_eq!(HumanFmt::Time(Duration::from_secs(3700)).to_string(), "1h1m40s");
    }

    #[test]
    fn format_rate() {
        assert_eq!(
            HumanFmt::Rate(2000, Duration::from_secs(2)).to_string(),
            "1.00kB/s"
        );
        assert_eq!(HumanFmt::Rate(500, Duration::ZERO).to_string(), "???B/s");
    }
}
