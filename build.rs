use vergen::EmitBuilder;

fn main() {
    // 生成构建时间，启动日志里输出
    EmitBuilder::builder()
        .all_build()
        .emit()
        .expect("Failed to generate build information");
}
