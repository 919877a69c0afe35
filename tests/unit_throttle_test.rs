use helmsman::core::throttle::Throttle;

#[test]
fn test_limit_tightens_as_load_rises() {
    let throttle = Throttle::with_cpus(4);
    assert_eq!(throttle.job_limit_for_load(0, 0.5), 8);
    assert_eq!(throttle.job_limit_for_load(0, 4.2), 4);
    assert_eq!(throttle.job_limit_for_load(0, 6.0), 2);
    assert_eq!(throttle.job_limit_for_load(0, 9.0), 1);
}

#[test]
fn test_configured_limit_is_a_ceiling_not_a_floor() {
    let throttle = Throttle::with_cpus(4);
    assert_eq!(throttle.job_limit_for_load(3, 0.0), 3);
    assert_eq!(throttle.job_limit_for_load(3, 9.0), 1);
    assert_eq!(throttle.job_limit_for_load(100, 0.0), 8);
}

#[test]
fn test_single_cpu_never_reaches_zero() {
    let throttle = Throttle::with_cpus(1);
    assert!(throttle.job_limit_for_load(0, 50.0) >= 1);
    assert!(throttle.job_limit_for_load(1, 50.0) >= 1);
}
