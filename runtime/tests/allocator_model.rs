//! Model-based test for the capacity allocator.
//!
//! Random sequences of reservations and cancellations run one after another
//! through the service and a plain in-memory model; after every step both
//! must agree on the outcome and on the confirmed headcount.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use turnstile_core::{RegistrationError, RegistrationId, RegistrationStatus, UserId};
use turnstile_runtime::{OperationContext, RegistrationService, TurnstileConfig};
use turnstile_testing::fixtures::{published_event, user};
use turnstile_testing::{InMemoryStore, test_clock};

#[derive(Clone, Debug)]
enum Step {
    Reserve {
        user: usize,
        quantity: u32,
        key: Option<u8>,
    },
    Cancel {
        pick: usize,
    },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0_usize..3, 0_u32..4, proptest::option::of(0_u8..3))
            .prop_map(|(user, quantity, key)| Step::Reserve { user, quantity, key }),
        1 => any::<usize>().prop_map(|pick| Step::Cancel { pick }),
    ]
}

#[derive(Default)]
struct Model {
    capacity: u32,
    registrations: Vec<(RegistrationId, u32, bool)>,
    keys: HashMap<(usize, u8), RegistrationId>,
}

impl Model {
    fn confirmed(&self) -> u32 {
        self.registrations
            .iter()
            .filter(|(_, _, live)| *live)
            .map(|(_, quantity, _)| quantity)
            .sum()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn allocator_matches_sequential_model(
        capacity in 1_u32..8,
        steps in proptest::collection::vec(step(), 1..30),
    ) {
        tokio_test::block_on(async {
            let store = InMemoryStore::new();
            let service = RegistrationService::with_clock(
                Arc::new(store.clone()),
                Arc::new(test_clock()),
                &TurnstileConfig::default(),
            );
            let ctx = OperationContext::new();
            let event = store.seed_event(published_event(capacity));
            let users: Vec<UserId> = (0..3).map(|_| store.seed_user(user()).id).collect();
            let mut model = Model { capacity, ..Model::default() };

            for step in steps {
                match step {
                    Step::Reserve { user, quantity, key } => {
                        let replay = key.and_then(|k| model.keys.get(&(user, k)).copied());
                        let result = service
                            .create_registration(
                                event.id,
                                users[user],
                                quantity,
                                key.map(|k| format!("key-{k}")),
                                &ctx,
                            )
                            .await;

                        if quantity == 0 {
                            assert_eq!(result, Err(RegistrationError::InvalidQuantity(0)));
                        } else if let Some(existing) = replay {
                            assert_eq!(result, Ok(existing));
                        } else if quantity <= model.capacity - model.confirmed() {
                            let id = result.unwrap();
                            model.registrations.push((id, quantity, true));
                            if let Some(k) = key {
                                model.keys.insert((user, k), id);
                            }
                        } else {
                            assert!(matches!(
                                result,
                                Err(RegistrationError::CapacityExceeded { .. })
                            ));
                        }
                    }
                    Step::Cancel { pick } => {
                        if model.registrations.is_empty() {
                            continue;
                        }
                        let index = pick % model.registrations.len();
                        let (id, _, live) = model.registrations[index];
                        let version = store.registration(id).unwrap().version;
                        let result = service.cancel_registration(id, version, None, &ctx).await;
                        if live {
                            assert_eq!(result, Ok(RegistrationStatus::Cancelled));
                            model.registrations[index].2 = false;
                        } else {
                            assert!(matches!(
                                result,
                                Err(RegistrationError::InvalidTransition { .. })
                            ));
                        }
                    }
                }

                assert_eq!(store.confirmed_spots(event.id), model.confirmed());
                assert!(model.confirmed() <= capacity);
            }
        });
    }
}
