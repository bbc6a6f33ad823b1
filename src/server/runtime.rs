/// Container-aware sizing for the tokio worker pool.
///
/// Order: `GATEWAY_WORKER_THREADS` env override, then the cgroup v2 CPU
/// quota, then host parallelism. In a container limited to a few cores on a
/// large host, tokio's default (host CPU count) over-provisions threads.
pub fn worker_thread_count() -> usize {
    if let Some(threads) = std::env::var("GATEWAY_WORKER_THREADS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
    {
        return threads.max(1);
    }

    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&content) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// Parse cgroup v2 `cpu.max` — "quota period", or "max period" for unlimited.
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period: i64 = parts.next()?.parse().ok()?;
    if quota == "max" || period <= 0 {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    if quota <= 0 {
        return None;
    }
    Some((quota / period) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cgroup_cpu_max() {
        assert_eq!(parse_cgroup_cpu_max("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_cpu_max("200000 100000"), Some(2));
        assert_eq!(parse_cgroup_cpu_max("max 100000"), None);
        assert_eq!(parse_cgroup_cpu_max(""), None);
        assert_eq!(parse_cgroup_cpu_max("-1 100000"), None);
    }
}
