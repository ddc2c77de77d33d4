// Console output. All terminal formatting lives here so the controller
// stays print-free.

use crate::bat_models::{time_cell, ArrivalStatus, DisplayRow, Route, Snapshot};
use chrono::Utc;
use chrono_tz::Asia::Taipei;

pub struct BatViews;

impl BatViews {
    pub fn show_welcome(route: &Route) {
        println!();
        println!("{}", "═".repeat(60));
        println!("  🚌 嘉義公車動態 - {}", route.label);
        println!("{}", "═".repeat(60));
        println!("  Enter 重新整理 | r1-r4 切換路線 | q 離開");
        println!();
    }

    pub fn show_timeline(route: &Route, snapshot: &Snapshot, rows: &[DisplayRow], alert: Option<&str>) {
        let clock = Utc::now().with_timezone(&Taipei).format("%H:%M:%S");
        println!();
        println!("{}", "═".repeat(60));
        println!("  🚌 {}", route.label);
        match &snapshot.time {
            Some(t) => println!("  資料時間 {}  (更新於 {})", t, clock),
            None => println!("  更新於 {}", clock),
        }
        println!("{}", "─".repeat(60));

        if let Some(alert) = alert {
            println!("  ⚠️  {}", alert);
            println!("{}", "─".repeat(60));
        }

        if snapshot.offline {
            println!("  📡 離線中，目前沒有可顯示的資料。");
        } else if rows.is_empty() {
            println!("  (沒有符合條件的站點)");
        } else {
            for row in rows {
                println!("{}", Self::format_row(row));
            }
        }

        println!("{}", "═".repeat(60));
    }

    fn format_row(row: &DisplayRow) -> String {
        let name = if row.name.is_empty() { "(未命名站點)" } else { &row.name };
        let mut line = format!(
            "  {} {:<7} {}",
            Self::status_glyph(row.status),
            time_cell(row.arrival_text.as_deref()),
            name
        );
        if row.has_vehicle {
            line.push_str(" 🚌");
        }
        if let Some(eta) = row.eta_min {
            line.push_str(&format!("  ({} 分鐘)", eta));
        }
        if row.dist_km.is_finite() {
            line.push_str(&format!("  [{:.1} km]", row.dist_km));
        }
        Self::colorize_row(row.status, &line)
    }

    fn status_glyph(status: ArrivalStatus) -> &'static str {
        match status {
            ArrivalStatus::Active => "●",
            ArrivalStatus::Upcoming => "◉",
            ArrivalStatus::Delayed => "○",
            ArrivalStatus::Dim => "·",
        }
    }

    fn colorize_row(status: ArrivalStatus, line: &str) -> String {
        let color = match status {
            ArrivalStatus::Active => "\x1b[38;2;255;59;92m",
            ArrivalStatus::Upcoming => "\x1b[38;2;255;165;0m",
            ArrivalStatus::Delayed => "\x1b[38;2;0;200;120m",
            ArrivalStatus::Dim => "\x1b[38;2;130;130;130m",
        };
        format!("{}{}\x1b[0m", color, line)
    }

    pub fn show_notice(notice: &str) {
        println!();
        println!("  ⚠️  {}", notice);
        println!();
    }

    pub fn goodbye_message() {
        println!();
        println!("{}", "═".repeat(60));
        println!("  👋 下次見！");
        println!("{}", "═".repeat(60));
        println!();
    }
}
