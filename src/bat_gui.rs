// GUI implementation for the bus arrival timeline using egui/eframe
use crate::bat_controllers::{FetchPhase, PollingController};
use crate::bat_models::{autoscroll_target, time_cell, ArrivalStatus, DisplayRow};
use chrono::Utc;
use chrono_tz::Asia::Taipei;
use eframe::egui;
use egui::{Color32, RichText, Ui};
use std::time::Duration;

// ============================================================================
// Application State
// ============================================================================

pub struct BatApp {
    controller: PollingController,

    // Display options
    keyword: String,
    only_active: bool,
    nearby_first: bool,

    // One-shot notice from a failed user-initiated fetch
    notice: Option<String>,

    // Last snapshot the auto-scroll ran against
    scrolled_serial: u64,
}

impl BatApp {
    pub fn new(_cc: &eframe::CreationContext<'_>, mut controller: PollingController) -> Self {
        controller.start();
        Self {
            controller,
            keyword: String::new(),
            only_active: false,
            nearby_first: false,
            notice: None,
            scrolled_serial: 0,
        }
    }
}

// ============================================================================
// Rendering
// ============================================================================

impl eframe::App for BatApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.controller.pump();
        self.controller.tick();
        if let Some(notice) = self.controller.take_notice() {
            self.notice = Some(notice);
        }
        // Keep pumping while idle so polls and results are picked up.
        ctx.request_repaint_after(Duration::from_millis(500));

        // Top panel with header
        egui::TopBottomPanel::top("top_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading(format!("🚌 {}", self.controller.selected_route().label));
                if self.controller.is_fetching() {
                    ui.spinner();
                }
                ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                    let now = Utc::now().with_timezone(&Taipei);
                    ui.label(now.format("%H:%M:%S").to_string());
                    if let Some(age) = self.controller.last_success_age() {
                        ui.weak(format!("更新於 {} 秒前", age.as_secs()));
                    }
                });
            });
        });

        // Controls: route picker, search, filters, manual refresh
        egui::TopBottomPanel::top("controls_panel").show(ctx, |ui| {
            ui.horizontal(|ui| {
                let current = self.controller.selected_route().clone();
                let mut switch_to: Option<String> = None;
                egui::ComboBox::from_label("路線")
                    .selected_text(&current.label)
                    .show_ui(ui, |ui| {
                        for route in self.controller.routes() {
                            let selected = route.id == current.id;
                            if ui.selectable_label(selected, &route.label).clicked() && !selected {
                                switch_to = Some(route.id.clone());
                            }
                        }
                    });
                if let Some(id) = switch_to {
                    self.controller.select_route(&id);
                }

                ui.separator();
                ui.label("🔍");
                ui.text_edit_singleline(&mut self.keyword);
                ui.checkbox(&mut self.only_active, "只看有車");
                ui.checkbox(&mut self.nearby_first, "離我最近優先");
                if ui.button("🔄 重新整理").clicked() {
                    self.controller.refresh();
                }
            });
        });

        // Global alert banner
        if let Some(alert) = self.controller.alert() {
            egui::TopBottomPanel::top("alert_panel").show(ctx, |ui| {
                ui.colored_label(Color32::from_rgb(255, 165, 0), format!("⚠ {}", alert));
            });
        }

        // One-shot notice from a failed user-initiated fetch
        if let Some(notice) = self.notice.clone() {
            egui::TopBottomPanel::top("notice_panel").show(ctx, |ui| {
                ui.horizontal(|ui| {
                    ui.colored_label(Color32::from_rgb(255, 99, 71), &notice);
                    if ui.small_button("知道了").clicked() {
                        self.notice = None;
                    }
                });
            });
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            let Some(snapshot) = self.controller.latest() else {
                ui.centered_and_justified(|ui| {
                    ui.vertical_centered(|ui| {
                        if self.controller.phase() == FetchPhase::Fetching {
                            ui.spinner();
                            ui.label("載入中...");
                        } else {
                            ui.label("尚無資料");
                        }
                    });
                });
                return;
            };

            if snapshot.offline {
                ui.vertical_centered(|ui| {
                    ui.add_space(24.0);
                    ui.label(RichText::new("📡 離線中").size(18.0).strong());
                    ui.label("目前沒有可顯示的資料。");
                });
                return;
            }
            if let Some(time) = &snapshot.time {
                ui.weak(format!("資料時間 {}", time));
            }

            let rows = self.controller.rows(&self.keyword, self.only_active, self.nearby_first);
            let serial = self.controller.snapshot_serial();
            let scroll_now = serial != self.scrolled_serial;
            if scroll_now {
                self.scrolled_serial = serial;
            }
            let target = autoscroll_target(&rows);

            if rows.is_empty() {
                ui.label("(沒有符合條件的站點)");
                return;
            }

            egui::ScrollArea::vertical().show(ui, |ui| {
                for (i, row) in rows.iter().enumerate() {
                    let response = Self::show_row_card(ui, row);
                    if scroll_now && Some(i) == target {
                        response.scroll_to_me(Some(egui::Align::Center));
                    }
                    ui.add_space(4.0);
                }
            });
        });
    }
}

impl BatApp {
    fn show_row_card(ui: &mut Ui, row: &DisplayRow) -> egui::Response {
        egui::Frame::group(ui.style())
            .show(ui, |ui| {
                ui.horizontal(|ui| {
                    let color = Self::status_color(row.status);
                    ui.colored_label(
                        color,
                        RichText::new(time_cell(row.arrival_text.as_deref()))
                            .size(18.0)
                            .strong(),
                    );
                    ui.vertical(|ui| {
                        let name = if row.name.is_empty() { "(未命名站點)" } else { &row.name };
                        ui.horizontal(|ui| {
                            ui.label(RichText::new(name).size(16.0).strong());
                            if row.has_vehicle {
                                ui.label("🚌");
                            }
                        });
                        let mut detail = String::new();
                        if !row.alt_name.is_empty() {
                            detail.push_str(&row.alt_name);
                        }
                        if !row.addr.is_empty() {
                            if !detail.is_empty() {
                                detail.push_str(" · ");
                            }
                            detail.push_str(&row.addr);
                        }
                        if !detail.is_empty() {
                            ui.weak(detail);
                        }
                    });
                    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                        if row.dist_km.is_finite() {
                            ui.weak(format!("{:.1} km", row.dist_km));
                        }
                        if let Some(eta) = row.eta_min {
                            ui.colored_label(Self::status_color(row.status), format!("{} 分", eta));
                        }
                    });
                });
            })
            .response
    }

    fn status_color(status: ArrivalStatus) -> Color32 {
        match status {
            ArrivalStatus::Active => Color32::from_rgb(255, 59, 92),
            ArrivalStatus::Upcoming => Color32::from_rgb(255, 165, 0),
            ArrivalStatus::Delayed => Color32::from_rgb(0, 200, 120),
            ArrivalStatus::Dim => Color32::from_rgb(130, 130, 130),
        }
    }
}

// ============================================================================
// Public entry point
// ============================================================================

pub fn run_gui(controller: PollingController) -> Result<(), eframe::Error> {
    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_inner_size([480.0, 800.0])
            .with_min_inner_size([360.0, 560.0]),
        ..Default::default()
    };

    eframe::run_native(
        "嘉義公車動態",
        options,
        Box::new(|cc| Ok(Box::new(BatApp::new(cc, controller)))),
    )
}
