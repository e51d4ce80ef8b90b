//! 协作式调度抽象。
//!
//! # 设计定位（Why）
//! - 状态机本身从不阻塞，也不直接持有事件循环；需要“稍后执行”的动作（补货、通知、关闭）
//!   都交给宿主提供的 [`Scheduler`]。
//! - 所有延迟动作按 FIFO 执行，这是通知顺序可预测的前提。
//!
//! # 使用方式（How）
//! - 生产环境由宿主事件循环实现 [`Scheduler::defer`]；
//! - 测试与简单宿主使用 [`TickQueue`]，手动调用 [`TickQueue::run_until_idle`] 推进。

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use tracing::warn;

/// 一次延迟执行的任务。
pub type Deferred = Box<dyn FnOnce() + 'static>;

/// 单线程协作调度器。
///
/// # 契约说明（What）
/// - `defer` 不得同步执行任务；任务必须在当前调用栈返回之后、按提交顺序执行；
/// - 实现可以是宿主的 microtask 队列，也可以是 [`TickQueue`]。
pub trait Scheduler {
    /// 提交一个延迟任务。
    fn defer(&self, task: Deferred);
}

/// 单次 `run_until_idle` 最多执行的任务数，超过视为状态机自旋。
const MAX_TICKS_PER_RUN: usize = 1_000_000;

/// 基于 `VecDeque` 的 FIFO 调度器。
///
/// 克隆得到的句柄共享同一队列。
#[derive(Clone, Default)]
pub struct TickQueue {
    tasks: Rc<RefCell<VecDeque<Deferred>>>,
}

impl TickQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以 trait object 形式返回共享句柄，供流构造函数使用。
    pub fn handle(&self) -> Rc<dyn Scheduler> {
        Rc::new(self.clone())
    }

    /// 尚未执行的任务数。
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// 执行队首任务；队列为空时返回 `false`。
    pub fn run_once(&self) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// 执行直到队列清空（包括执行期间新提交的任务），返回执行的任务数。
    pub fn run_until_idle(&self) -> usize {
        let mut executed = 0;
        while self.run_once() {
            executed += 1;
            if executed >= MAX_TICKS_PER_RUN {
                warn!(executed, "tick queue did not settle, stopping");
                break;
            }
        }
        executed
    }
}

impl Scheduler for TickQueue {
    fn defer(&self, task: Deferred) {
        self.tasks.borrow_mut().push_back(task);
    }
}

impl fmt::Debug for TickQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TickQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn tasks_run_in_submission_order_including_nested() {
        let queue = TickQueue::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let (q, o) = (queue.clone(), Rc::clone(&order));
        queue.defer(Box::new(move || {
            o.borrow_mut().push(1);
            let o2 = Rc::clone(&o);
            q.defer(Box::new(move || o2.borrow_mut().push(3)));
        }));
        let o = Rc::clone(&order);
        queue.defer(Box::new(move || o.borrow_mut().push(2)));

        assert_eq!(queue.pending(), 2);
        assert_eq!(queue.run_until_idle(), 3);
        assert_eq!(*order.borrow(), vec![1, 2, 3]);
    }

    #[test]
    fn defer_never_runs_inline() {
        let queue = TickQueue::new();
        let ran = Rc::new(Cell::new(false));
        let flag = Rc::clone(&ran);
        queue.handle().defer(Box::new(move || flag.set(true)));
        assert!(!ran.get());
        assert!(queue.run_once());
        assert!(ran.get());
        assert!(!queue.run_once());
    }
}
