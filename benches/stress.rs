use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use chairbook::engine::{NewAppointment, SlotQuery};
use chairbook::model::*;
use chairbook::registry::{Collaborators, InMemoryRegistry};
use chairbook::observability::{init_logging, init_metrics};
use chairbook::{Engine, EngineConfig, ErrorKind};

const SLOT: Ms = 30 * MINUTE_MS;

struct Shop {
    engine: Arc<Engine>,
    registry: Arc<InMemoryRegistry>,
    tenant: Ulid,
    branch: Ulid,
    staff: Vec<Ulid>,
    service: Ulid,
}

impl Shop {
    async fn open(label: &str, n_staff: usize) -> Self {
        let config = EngineConfig {
            data_dir: std::env::temp_dir().join(format!("chairbook_bench_{label}_{}", Ulid::new())),
            ..EngineConfig::default()
        };
        let registry = Arc::new(InMemoryRegistry::new());
        let tenant = Ulid::new();
        let branch = Ulid::new();
        let staff = (0..n_staff)
            .map(|_| registry.add_staff(tenant, branch))
            .collect();
        let service = registry.add_service(tenant, 30, 2_500);
        let engine = Arc::new(
            Engine::new(config, Collaborators::in_memory(registry.clone()))
                .expect("engine failed to open"),
        );
        let open = NaiveTime::from_hms_opt(0, 0, 0).unwrap();
        let close = NaiveTime::from_hms_opt(23, 59, 0).unwrap();
        engine
            .replace_working_hours(branch, (0..7).map(|d| (d, open, close)).collect())
            .await
            .expect("working hours");
        Self {
            engine,
            registry,
            tenant,
            branch,
            staff,
            service,
        }
    }

    fn request(&self, staff_id: Ulid, start: Ms) -> NewAppointment {
        NewAppointment {
            tenant_id: self.tenant,
            branch_id: self.branch,
            service_id: self.service,
            customer_id: self.registry.add_customer(),
            staff: StaffAssignment::Staff(staff_id),
            start,
            notes: None,
            lock_id: None,
            actor: Actor::System,
        }
    }
}

fn base() -> Ms {
    at(
        NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
        NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
    )
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

async fn phase1_sequential() {
    let shop = Shop::open("sequential", 1).await;
    let staff = shop.staff[0];
    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let req = shop.request(staff, base() + i as i64 * SLOT);
        let t = Instant::now();
        shop.engine.create_appointment(req).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} bookings in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_concurrent() {
    let n_staff = 10;
    let n_per_staff = 200;
    let shop = Arc::new(Shop::open("concurrent", n_staff).await);

    let start = Instant::now();
    let mut handles = Vec::new();
    for staff in shop.staff.clone() {
        let shop = shop.clone();
        handles.push(tokio::spawn(async move {
            for j in 0..n_per_staff {
                let req = shop.request(staff, base() + j as i64 * SLOT);
                shop.engine.create_appointment(req).await.unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_staff * n_per_staff;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_staff} staff x {n_per_staff} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_availability_under_load() {
    let shop = Arc::new(Shop::open("availability", 5).await);
    for (k, &staff) in shop.staff.iter().enumerate() {
        for i in 0..100 {
            let start = base() + (i * 3 + k as i64) * SLOT;
            shop.engine
                .create_appointment(shop.request(staff, start))
                .await
                .unwrap();
        }
    }

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for (w, staff) in shop.staff.clone().into_iter().enumerate() {
        let shop = shop.clone();
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let start = base() + (10_000 + w as i64 * 100_000 + i) * SLOT;
                let _ = shop.engine.create_appointment(shop.request(staff, start)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 200;
    let from = NaiveDate::from_ymd_opt(2030, 1, 1).unwrap();
    let to = NaiveDate::from_ymd_opt(2030, 1, 7).unwrap();
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        let shop = shop.clone();
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                let calendar = shop
                    .engine
                    .get_available_slots(SlotQuery::new(shop.branch, from, to).slot_minutes(30))
                    .await
                    .unwrap();
                let n = calendar.count();
                latencies.push(t.elapsed());
                assert!(n > 0);
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query (7 days, 5 staff)", &mut all);
}

async fn phase4_contention_storm() {
    let shop = Arc::new(Shop::open("storm", 1).await);
    let staff = shop.staff[0];
    let n_tasks = 50;
    let attempts_per_task = 20;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let shop = shop.clone();
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..attempts_per_task {
                // Everyone fights over the same twenty slots.
                let req = shop.request(staff, base() + i as i64 * SLOT);
                match shop.engine.create_appointment(req).await {
                    Ok(_) => won.fetch_add(1, Ordering::Relaxed),
                    Err(e) if e.kind() == ErrorKind::Conflict => lost.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {attempts_per_task} contended slots: {won} booked, {lost} conflicts in {:.2}s",
        elapsed.as_secs_f64()
    );
    assert_eq!(won, attempts_per_task, "a contended slot was double booked");
}

#[tokio::main]
async fn main() {
    init_logging();
    init_metrics(EngineConfig::from_env().metrics_port).expect("metrics exporter failed to start");

    println!("=== chairbook stress benchmark ===\n");

    println!("[phase 1] sequential booking throughput");
    phase1_sequential().await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent().await;

    println!("\n[phase 3] availability latency under write load");
    phase3_availability_under_load().await;

    println!("\n[phase 4] contention storm");
    phase4_contention_storm().await;

    println!("\n=== benchmark complete ===");
}
