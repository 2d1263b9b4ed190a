#[cfg(test)]
mod test {
    use resilient_pool::{DriverError, Error, RetryPolicy, RetryableErrors};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::Instant;

    fn assert_close(actual: Duration, expected: Duration) {
        assert!(
            actual >= expected && actual <= expected + Duration::from_millis(5),
            "expected ~{expected:?}, got {actual:?}"
        );
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let attempts = Mutex::new(Vec::new());
        let attempts = &attempts;
        let started = Instant::now();
        let r = policy()
            .execute(
                "select",
                move || async move {
                    let mut seen = attempts.lock().unwrap();
                    seen.push(Instant::now());
                    match seen.len() {
                        1 | 2 => Err(Error::Driver(DriverError::refused("connection refused"))),
                        n => Ok(n),
                    }
                },
                &RetryableErrors::default(),
            )
            .await;
        assert_eq!(r.unwrap(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));

        let seen = attempts.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], started);
        assert_close(seen[1] - seen[0], Duration::from_millis(100));
        assert_close(seen[2] - seen[1], Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_bounded() {
        let attempts = Mutex::new(0u32);
        let attempts = &attempts;
        let r: Result<(), Error> = policy()
            .execute(
                "select",
                move || async move {
                    *attempts.lock().unwrap() += 1;
                    Err(Error::Timeout(Duration::from_secs(1)))
                },
                &RetryableErrors::default(),
            )
            .await;
        assert!(matches!(r, Err(Error::Timeout(_))));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_error_is_surfaced() {
        let attempts = Mutex::new(0u32);
        let attempts = &attempts;
        let r: Result<(), Error> = policy()
            .execute(
                "select",
                move || async move {
                    let mut n = attempts.lock().unwrap();
                    *n += 1;
                    Err(Error::Driver(DriverError::reset(format!("attempt {}", *n))))
                },
                &RetryableErrors::default(),
            )
            .await;
        match r {
            Err(Error::Driver(e)) => assert_eq!(e.message, "attempt 3"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_is_not_retried() {
        let attempts = Mutex::new(0u32);
        let attempts = &attempts;
        let started = Instant::now();
        let r: Result<(), Error> = policy()
            .execute(
                "insert",
                move || async move {
                    *attempts.lock().unwrap() += 1;
                    Err(Error::Driver(DriverError::server("23505", "duplicate key")))
                },
                &RetryableErrors::default(),
            )
            .await;
        assert_eq!(r.unwrap_err().code(), Some("23505"));
        assert_eq!(*attempts.lock().unwrap(), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_allow_list() {
        let attempts = Mutex::new(0u32);
        let attempts = &attempts;
        let only_deadlocks = RetryableErrors {
            kinds: vec![],
            codes: vec!["40P01".to_string()],
        };
        let r: Result<(), Error> = policy()
            .execute(
                "update",
                move || async move {
                    *attempts.lock().unwrap() += 1;
                    Err(Error::Driver(DriverError::refused("connection refused")))
                },
                &only_deadlocks,
            )
            .await;
        assert!(r.is_err());
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped() {
        let p = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            multiplier: 2.0,
        };
        let started = Instant::now();
        let always = |_: &&str| true;
        let r: Result<(), &str> = p.execute("cap", || async { Err("busy") }, &always).await;
        assert!(r.is_err());
        //100 + 200 + 250 + 250
        assert_close(started.elapsed(), Duration::from_millis(800));
    }
}
