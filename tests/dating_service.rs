//! Dating service monitor, per spec.md §8 scenario 2: girl and boy tasks
//! each offer a phone number and receive their partner's number back, one
//! pairing at a time. Scaled down from 20/20 to 6/6 callers to keep the
//! real OS thread count modest.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use uxk::serial::Condition;
use uxk::task::{Task, TaskId};
use uxk::{Priority, Serial};

const NUM_PAIRS: u32 = 6;

enum Slot {
    Empty,
    Girl(u32, TaskId),
    Boy(u32, TaskId),
}

struct DatingService {
    serial: Arc<Serial>,
    partner_ready: Condition,
    slot: Mutex<Slot>,
    /// Partner numbers delivered to a waiting caller, keyed by its own task
    /// id, since the caller that completes a pairing already knows which
    /// task it matched with.
    delivered: Mutex<HashMap<TaskId, u32>>,
}

impl DatingService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            serial: Serial::new(Some("dating-service".into())),
            partner_ready: Condition::new(),
            slot: Mutex::new(Slot::Empty),
            delivered: Mutex::new(HashMap::new()),
        })
    }

    /// Offer `my_phone` and block until a task of the opposite sex offers
    /// one too, returning its phone number.
    fn exchange(&self, caller: &Arc<Task>, my_phone: u32, i_am_girl: bool) -> u32 {
        self.serial.enter(caller).unwrap();
        loop {
            let matched = {
                let slot = self.slot.lock().unwrap();
                match &*slot {
                    Slot::Boy(num, tid) if i_am_girl => Some((*num, *tid)),
                    Slot::Girl(num, tid) if !i_am_girl => Some((*num, *tid)),
                    _ => None,
                }
            };
            if let Some((partner_num, partner_tid)) = matched {
                *self.slot.lock().unwrap() = Slot::Empty;
                self.delivered.lock().unwrap().insert(partner_tid, my_phone);
                self.serial.broadcast(&self.partner_ready);
                self.serial.exit();
                return partner_num;
            }

            let slot_is_empty = matches!(&*self.slot.lock().unwrap(), Slot::Empty);
            if slot_is_empty {
                *self.slot.lock().unwrap() = if i_am_girl {
                    Slot::Girl(my_phone, caller.id)
                } else {
                    Slot::Boy(my_phone, caller.id)
                };
                // Wait until some opposite-sex caller matches us and records
                // our delivered partner number.
                loop {
                    self.serial.wait(caller, &self.partner_ready, 0);
                    if let Some(partner) = self.delivered.lock().unwrap().remove(&caller.id) {
                        self.serial.exit();
                        return partner;
                    }
                    // Spurious wake: someone else's pairing or turnover.
                }
            } else {
                // Same sex already occupying the slot; wait our turn.
                self.serial.wait(caller, &self.partner_ready, 0);
            }
        }
    }
}

#[test]
fn every_pairing_is_a_mutual_inverse() {
    let kernel = common::start_kernel(4);
    let cluster = Arc::clone(kernel.system_cluster());
    let service = DatingService::new();

    let girl_sees: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));
    let boy_sees: Arc<Mutex<HashMap<u32, u32>>> = Arc::new(Mutex::new(HashMap::new()));

    let mut tasks = Vec::new();

    for i in 0..NUM_PAIRS {
        let girl_phone = 1000 + i;
        let service = Arc::clone(&service);
        let girl_sees = Arc::clone(&girl_sees);
        let task = Task::new(
            Some(format!("girl-{i}")),
            Priority(10),
            64 * 1024,
            move || {
                let me = uxk::processor::current_task().expect("running as a task");
                let boy_phone = service.exchange(&me, girl_phone, true);
                girl_sees.lock().unwrap().insert(girl_phone, boy_phone);
            },
        );
        common::spawn(&cluster, Arc::clone(&task));
        tasks.push(task);
    }

    for i in 0..NUM_PAIRS {
        let boy_phone = 2000 + i;
        let service = Arc::clone(&service);
        let boy_sees = Arc::clone(&boy_sees);
        let task = Task::new(
            Some(format!("boy-{i}")),
            Priority(10),
            64 * 1024,
            move || {
                let me = uxk::processor::current_task().expect("running as a task");
                let girl_phone = service.exchange(&me, boy_phone, false);
                boy_sees.lock().unwrap().insert(boy_phone, girl_phone);
            },
        );
        common::spawn(&cluster, Arc::clone(&task));
        tasks.push(task);
    }

    common::wait_for_halt(&tasks, StdDuration::from_secs(10));

    let girl_sees = girl_sees.lock().unwrap();
    let boy_sees = boy_sees.lock().unwrap();
    assert_eq!(girl_sees.len(), NUM_PAIRS as usize);
    assert_eq!(boy_sees.len(), NUM_PAIRS as usize);
    for (&girl, &boy) in girl_sees.iter() {
        assert_eq!(
            boy_sees.get(&boy),
            Some(&girl),
            "girl {girl} saw boy {boy}, but that boy didn't see girl {girl} back"
        );
    }
}
