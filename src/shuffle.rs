//! The permutation step between secret-shared row id bundles and their opened existence flags.
//!
//! Production deployments plug in an oblivious shuffle through [`Shuffler`]. The shufflers in
//! [`insecure`] only exercise the surrounding protocol.

use std::future::Future;

use crate::{
    channel::Channel,
    secret::{Error, SecretBitString, Session},
};

/// Permutes the rows of a secret-shared bundle.
pub trait Shuffler {
    /// Returns `bundle` (whose batch size must be `size`) with its rows permuted, keeping the
    /// number and order of bit planes.
    fn shuffle<C: Channel>(
        &self,
        session: &Session<C>,
        bundle: SecretBitString,
        size: usize,
    ) -> impl Future<Output = Result<SecretBitString, Error>>;
}

/// Creates one [`Shuffler`] per protocol run.
pub trait ShufflerFactory {
    /// The shuffler created by this factory.
    type Shuffler: Shuffler;

    /// Creates a fresh shuffler.
    fn create(&self) -> Self::Shuffler;
}

fn check_size(bundle: &SecretBitString, size: usize) -> Result<(), Error> {
    if bundle.batch_size() == size {
        Ok(())
    } else {
        Err(Error::BatchMismatch {
            expected: size,
            actual: bundle.batch_size(),
        })
    }
}

/// Shufflers whose permutation is known to both parties, for testing only.
pub mod insecure {
    use rand::{SeedableRng, seq::SliceRandom};
    use rand_chacha::ChaCha20Rng;

    use super::*;

    /// Leaves the rows in place.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NonShuffler;

    impl Shuffler for NonShuffler {
        async fn shuffle<C: Channel>(
            &self,
            _session: &Session<C>,
            bundle: SecretBitString,
            size: usize,
        ) -> Result<SecretBitString, Error> {
            check_size(&bundle, size)?;
            Ok(bundle)
        }
    }

    impl ShufflerFactory for NonShuffler {
        type Shuffler = NonShuffler;

        fn create(&self) -> NonShuffler {
            NonShuffler
        }
    }

    /// Permutes the rows with a permutation that both parties derive from a shared seed.
    #[derive(Debug, Clone, Copy)]
    pub struct DummyShuffler {
        seed: u64,
    }

    impl DummyShuffler {
        /// Both parties must use the same seed.
        pub fn new(seed: u64) -> Self {
            Self { seed }
        }

        /// The permutation applied to a bundle of `size` rows: row `i` of the output is row
        /// `permutation(size)[i]` of the input.
        pub fn permutation(&self, size: usize) -> Vec<usize> {
            let mut rng = ChaCha20Rng::seed_from_u64(self.seed);
            let mut perm: Vec<usize> = (0..size).collect();
            perm.shuffle(&mut rng);
            perm
        }
    }

    impl Shuffler for DummyShuffler {
        async fn shuffle<C: Channel>(
            &self,
            _session: &Session<C>,
            bundle: SecretBitString,
            size: usize,
        ) -> Result<SecretBitString, Error> {
            check_size(&bundle, size)?;
            Ok(bundle.permuted(&self.permutation(size)))
        }
    }

    /// Hands out [`DummyShuffler`]s with consecutive seeds, so that repeated runs use different
    /// permutations while both parties stay in sync.
    #[derive(Debug)]
    pub struct DummyShufflerFactory {
        seed: u64,
        runs: std::sync::atomic::AtomicU64,
    }

    impl DummyShufflerFactory {
        /// Both parties must use the same seed.
        pub fn new(seed: u64) -> Self {
            Self {
                seed,
                runs: 0.into(),
            }
        }
    }

    impl ShufflerFactory for DummyShufflerFactory {
        type Shuffler = DummyShuffler;

        fn create(&self) -> DummyShuffler {
            let run = self.runs.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            DummyShuffler::new(self.seed.wrapping_add(run))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::secret::simulated_sessions;

        #[test]
        fn permutation_is_deterministic() {
            let a = DummyShuffler::new(7).permutation(50);
            let b = DummyShuffler::new(7).permutation(50);
            assert_eq!(a, b);
            let mut sorted = a.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..50).collect::<Vec<_>>());
        }

        #[test]
        fn factory_changes_seed_per_run() {
            let factory = DummyShufflerFactory::new(3);
            assert_eq!(factory.create().permutation(20), DummyShuffler::new(3).permutation(20));
            assert_eq!(factory.create().permutation(20), DummyShuffler::new(4).permutation(20));
        }

        #[tokio::test]
        async fn size_must_match_batch() {
            let (s0, _s1, _dealer) = simulated_sessions();
            let bundle = SecretBitString::from_local_share(&s0, vec![vec![true; 4]], 4).unwrap();
            let err = NonShuffler.shuffle(&s0, bundle.clone(), 5).await.unwrap_err();
            assert!(matches!(err, Error::BatchMismatch { expected: 5, actual: 4 }));
            let shuffled = DummyShuffler::new(1).shuffle(&s0, bundle, 4).await.unwrap();
            assert_eq!(shuffled.batch_size(), 4);
        }
    }
}
