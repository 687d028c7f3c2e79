#[cfg(feature = "debug")]
#[macro_export]
macro_rules! jrnl_assert {
    ($e:expr) => {
        assert!(
            $e,
            "jrnl-rs: unexpected state at {}:{}:{}",
            file!(),
            line!(),
            column!()
        );
    };
}

#[cfg(not(feature = "debug"))]
#[macro_export]
macro_rules! jrnl_assert {
    ($e:expr) => {};
}
