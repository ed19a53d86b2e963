#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Duration,
    };

    use crate::bg::BgToken;

    #[test]
    fn test_acquire_fails_until_loaned() {
        let token = BgToken::new();
        assert!(!token.acquire());
        token.loan();
        assert!(token.acquire());
        // Held: a second acquire fails until release.
        assert!(!token.acquire());
        token.release();
        assert!(token.acquire());
    }

    #[test]
    fn test_reclaim_blocks_until_release() {
        let token = Arc::new(BgToken::new());
        let released = Arc::new(AtomicBool::new(false));

        token.loan();
        assert!(token.acquire());

        let background_token = Arc::clone(&token);
        let background_released = Arc::clone(&released);
        let background = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            background_released.store(true, Ordering::Release);
            background_token.release();
        });

        // Blocks until the background thread lets go.
        token.reclaim();
        assert!(released.load(Ordering::Acquire));
        assert!(!token.held());
        background.join().unwrap();
    }

    #[test]
    fn test_acquire_wait_rendezvous() {
        let token = Arc::new(BgToken::new());

        let background_token = Arc::clone(&token);
        let background = thread::spawn(move || {
            background_token.acquire_wait();
            background_token.release();
        });

        thread::sleep(Duration::from_millis(20));
        token.loan();
        background.join().unwrap();
        assert!(!token.held());
    }

    #[test]
    fn test_reclaim_revokes_loan() {
        let token = BgToken::new();
        token.loan();
        token.reclaim();
        // No longer on loan: the background side cannot take it.
        assert!(!token.acquire());
    }
}
